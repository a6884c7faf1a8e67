use crate::errors::Error;
use crate::wire::FieldTable;
use std::fmt;
use std::sync::Arc;

/// A recorded exchange declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    pub name: String,
    pub type_: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

/// A recorded queue declaration. `server_named` queues are re-declared
/// anonymously during recovery and references to the old generated name are
/// rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub server_named: bool,
    pub arguments: FieldTable,
}

/// A recorded binding; `destination` is a queue name for queue bindings and
/// an exchange name for exchange-to-exchange bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// One entity from the topology record, as shown to the recovery filter and
/// exception handler.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEntity<'a> {
    Exchange(&'a RecordedExchange),
    Queue(&'a RecordedQueue),
    ExchangeBinding(&'a RecordedBinding),
    QueueBinding(&'a RecordedBinding),
}

impl fmt::Display for RecordedEntity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordedEntity::Exchange(e) => write!(f, "exchange {}", e.name),
            RecordedEntity::Queue(q) => write!(f, "queue {}", q.name),
            RecordedEntity::ExchangeBinding(b) => {
                write!(f, "exchange binding {} -> {}", b.source, b.destination)
            }
            RecordedEntity::QueueBinding(b) => {
                write!(f, "queue binding {} -> {}", b.source, b.destination)
            }
        }
    }
}

/// Predicate deciding which recorded entities are replayed during
/// recovery. The default recovers everything.
pub type TopologyRecoveryFilter = Arc<dyn Fn(&RecordedEntity<'_>) -> bool + Send + Sync>;

/// What to do when replaying one entity fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Skip this entity and continue with the rest.
    Skip,

    /// Retry the declare once more; a second failure aborts.
    Retry,

    /// Abort recovery; the connection surfaces as permanently closed.
    Abort,
}

/// Per-entity error hook consulted during topology replay. Non-retryable
/// errors (e.g. ACCESS_REFUSED) abort regardless of the returned action.
pub type TopologyRecoveryExceptionHandler =
    Arc<dyn Fn(&RecordedEntity<'_>, &Error) -> RecoveryAction + Send + Sync>;

/// Ordered log of declared-and-still-live topology, owned by the
/// connection and replayed after an involuntary disconnect.
///
/// Within each category, the original declaration order is preserved;
/// across categories replay runs exchanges, queues, exchange bindings,
/// then queue bindings (per-channel QoS/confirm/consumer state is replayed
/// by the channel rebinding pass that follows).
#[derive(Debug, Default)]
pub struct TopologyRecord {
    exchanges: Vec<RecordedExchange>,
    queues: Vec<RecordedQueue>,
    exchange_bindings: Vec<RecordedBinding>,
    queue_bindings: Vec<RecordedBinding>,
}

impl TopologyRecord {
    pub(crate) fn new() -> TopologyRecord {
        TopologyRecord::default()
    }

    pub(crate) fn record_exchange(&mut self, exchange: RecordedExchange) {
        // redeclaring is idempotent server-side; keep the first record
        if !self.exchanges.iter().any(|e| e.name == exchange.name) {
            self.exchanges.push(exchange);
        }
    }

    pub(crate) fn record_queue(&mut self, queue: RecordedQueue) {
        if !self.queues.iter().any(|q| q.name == queue.name) {
            self.queues.push(queue);
        }
    }

    pub(crate) fn record_exchange_binding(&mut self, binding: RecordedBinding) {
        if !self.exchange_bindings.contains(&binding) {
            self.exchange_bindings.push(binding);
        }
    }

    pub(crate) fn record_queue_binding(&mut self, binding: RecordedBinding) {
        if !self.queue_bindings.contains(&binding) {
            self.queue_bindings.push(binding);
        }
    }

    pub(crate) fn forget_exchange(&mut self, name: &str) {
        self.exchanges.retain(|e| e.name != name);
        self.exchange_bindings
            .retain(|b| b.source != name && b.destination != name);
        self.queue_bindings.retain(|b| b.source != name);
    }

    pub(crate) fn forget_queue(&mut self, name: &str) {
        self.queues.retain(|q| q.name != name);
        self.queue_bindings.retain(|b| b.destination != name);
    }

    pub(crate) fn forget_exchange_binding(&mut self, binding: &RecordedBinding) {
        self.exchange_bindings.retain(|b| b != binding);
    }

    pub(crate) fn forget_queue_binding(&mut self, binding: &RecordedBinding) {
        self.queue_bindings.retain(|b| b != binding);
    }

    /// Rewrite references to a server-named queue that came back from
    /// recovery under a fresh generated name.
    pub(crate) fn rename_queue(&mut self, old: &str, new: &str) {
        for queue in &mut self.queues {
            if queue.name == old {
                queue.name = new.to_string();
            }
        }
        for binding in &mut self.queue_bindings {
            if binding.destination == old {
                binding.destination = new.to_string();
            }
        }
    }

    pub(crate) fn exchanges(&self) -> &[RecordedExchange] {
        &self.exchanges
    }

    pub(crate) fn queues(&self) -> &[RecordedQueue] {
        &self.queues
    }

    pub(crate) fn exchange_bindings(&self) -> &[RecordedBinding] {
        &self.exchange_bindings
    }

    pub(crate) fn queue_bindings(&self) -> &[RecordedBinding] {
        &self.queue_bindings
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
            && self.queues.is_empty()
            && self.exchange_bindings.is_empty()
            && self.queue_bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(name: &str) -> RecordedQueue {
        RecordedQueue {
            name: name.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            server_named: false,
            arguments: FieldTable::new(),
        }
    }

    fn binding(source: &str, destination: &str) -> RecordedBinding {
        RecordedBinding {
            source: source.to_string(),
            destination: destination.to_string(),
            routing_key: String::new(),
            arguments: FieldTable::new(),
        }
    }

    #[test]
    fn declaration_order_preserved() {
        let mut record = TopologyRecord::new();
        record.record_queue(queue("b"));
        record.record_queue(queue("a"));
        record.record_queue(queue("c"));
        let names: Vec<&str> = record.queues().iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn redeclare_does_not_duplicate() {
        let mut record = TopologyRecord::new();
        record.record_queue(queue("q"));
        record.record_queue(queue("q"));
        assert_eq!(record.queues().len(), 1);
    }

    #[test]
    fn deleting_queue_prunes_its_bindings() {
        let mut record = TopologyRecord::new();
        record.record_queue(queue("q"));
        record.record_queue_binding(binding("x", "q"));
        record.record_queue_binding(binding("x", "other"));

        record.forget_queue("q");
        assert!(record.queues().is_empty());
        assert_eq!(record.queue_bindings().len(), 1);
        assert_eq!(record.queue_bindings()[0].destination, "other");
    }

    #[test]
    fn deleting_exchange_prunes_bindings_both_ways() {
        let mut record = TopologyRecord::new();
        record.record_exchange_binding(binding("x", "y"));
        record.record_exchange_binding(binding("z", "x"));
        record.record_queue_binding(binding("x", "q"));

        record.forget_exchange("x");
        assert!(record.exchange_bindings().is_empty());
        assert!(record.queue_bindings().is_empty());
    }

    #[test]
    fn rename_rewrites_bindings() {
        let mut record = TopologyRecord::new();
        let mut q = queue("amq.gen-old");
        q.server_named = true;
        record.record_queue(q);
        record.record_queue_binding(binding("x", "amq.gen-old"));

        record.rename_queue("amq.gen-old", "amq.gen-new");
        assert_eq!(record.queues()[0].name, "amq.gen-new");
        assert_eq!(record.queue_bindings()[0].destination, "amq.gen-new");
    }
}

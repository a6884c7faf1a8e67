use crate::errors::*;
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::time::Duration;

/// Payload for a publisher confirmation message (either an
/// [ack](Confirm::Ack) or a [nack](Confirm::Nack)) from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfirmPayload {
    /// The tag from the server. Tags are sequentially increasing integers
    /// beginning with 1 (once publisher confirms are enabled on the
    /// channel).
    pub delivery_tag: u64,

    /// If true, the confirmation applies to all previously-unconfirmed
    /// messages with delivery tags less than or equal to this payload's
    /// [`delivery_tag`](ConfirmPayload::delivery_tag).
    pub multiple: bool,
}

/// A publisher confirmation message from the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confirm {
    /// Acknowledgment that the server has received the message(s) described
    /// by the associated payload. Note that acks do not imply the messages
    /// have been handled by a consumer, merely that the server has taken
    /// responsibility for them.
    Ack(ConfirmPayload),

    /// Notification that the message(s) described by the associated payload
    /// have been rejected.
    Nack(ConfirmPayload),
}

/// Resolution of a single tracked publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    /// The server took responsibility for the message.
    Ack,

    /// The server rejected the message.
    Nack,
}

impl ConfirmStatus {
    fn from_ack(is_ack: bool) -> ConfirmStatus {
        if is_ack {
            ConfirmStatus::Ack
        } else {
            ConfirmStatus::Nack
        }
    }
}

/// Completion handle for one publish on a confirm-enabled channel.
///
/// The sequence number is assigned on the connection's I/O thread at the
/// moment the publish enters the outbound write buffer, so handles resolve
/// in wire order. Dropping the handle detaches it; the sequence stays
/// tracked until the server confirms it.
#[derive(Debug)]
pub struct ConfirmHandle {
    rx: Receiver<ConfirmStatus>,
}

impl ConfirmHandle {
    pub(crate) fn new() -> (Sender<ConfirmStatus>, ConfirmHandle) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, ConfirmHandle { rx })
    }

    /// Block until the server acks or nacks this publish. Fails with
    /// `OperationInterrupted` if the channel closes first.
    pub fn wait(&self) -> Result<ConfirmStatus> {
        self.rx.recv().map_err(|_| OperationInterruptedSnafu.build())
    }

    /// Like [`wait`](ConfirmHandle::wait), bounded by `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ConfirmStatus> {
        use crossbeam_channel::RecvTimeoutError;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ContinuationTimeoutSnafu { channel_id: 0u16 }.build(),
            RecvTimeoutError::Disconnected => OperationInterruptedSnafu.build(),
        })
    }

    /// Non-blocking check; `None` while the publish is still outstanding.
    pub fn try_wait(&self) -> Option<ConfirmStatus> {
        self.rx.try_recv().ok()
    }
}

/// Per-channel bookkeeping of unconfirmed publishes, owned by the I/O
/// thread. Sequences are assigned in the order publishes enter the write
/// buffer; the unresolved set is always a contiguous suffix of the assigned
/// sequence space.
pub(crate) struct ConfirmTracker {
    next_seq: u64,
    unconfirmed: BTreeMap<u64, Option<Sender<ConfirmStatus>>>,
}

impl ConfirmTracker {
    pub(crate) fn new() -> ConfirmTracker {
        ConfirmTracker {
            next_seq: 1,
            unconfirmed: BTreeMap::new(),
        }
    }

    /// Assign the next sequence to a publish, binding its completion cell
    /// (None for publishes whose handle was detached at submission).
    pub(crate) fn assign(&mut self, cell: Option<Sender<ConfirmStatus>>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.unconfirmed.insert(seq, cell);
        seq
    }

    /// Resolve server confirmation(s). `multiple` resolves every
    /// outstanding sequence `<= delivery_tag`; otherwise only the exact
    /// match resolves.
    pub(crate) fn resolve(&mut self, delivery_tag: u64, multiple: bool, is_ack: bool) {
        let status = ConfirmStatus::from_ack(is_ack);
        if multiple {
            let resolved: Vec<u64> = self
                .unconfirmed
                .range(..=delivery_tag)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in resolved {
                if let Some(Some(cell)) = self.unconfirmed.remove(&seq) {
                    // a send failure just means the handle was dropped
                    let _ = cell.send(status);
                }
            }
        } else if let Some(cell) = self.unconfirmed.remove(&delivery_tag) {
            if let Some(cell) = cell {
                let _ = cell.send(status);
            }
        }
    }

    /// Number of publishes not yet confirmed.
    pub(crate) fn outstanding(&self) -> usize {
        self.unconfirmed.len()
    }

    /// True if the unresolved sequences form a contiguous suffix of the
    /// assigned space (holes would mean we lost track of a confirm).
    #[cfg(test)]
    fn is_contiguous_suffix(&self) -> bool {
        let mut expected = match self.unconfirmed.keys().next() {
            Some(first) => *first,
            None => return true,
        };
        for seq in self.unconfirmed.keys() {
            if *seq != expected {
                return false;
            }
            expected += 1;
        }
        expected == self.next_seq
    }
}

/// Utility to convert a stream of raw server confirms (which may be
/// cumulative or out of order) into perfectly sequential single-tag
/// confirms.
///
/// Feed every confirm from a confirm listener through
/// [`process`](ConfirmSmoother::process); it returns the confirms (possibly
/// none) that are now contiguous with everything already seen.
#[derive(Debug)]
pub struct ConfirmSmoother {
    expected_next: u64,
    pending: BTreeMap<u64, ConfirmStatus>,
}

impl Default for ConfirmSmoother {
    fn default() -> ConfirmSmoother {
        ConfirmSmoother::new()
    }
}

impl ConfirmSmoother {
    pub fn new() -> ConfirmSmoother {
        ConfirmSmoother {
            expected_next: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Process a raw confirm from the server. Returns (possibly empty)
    /// per-tag confirms in strictly increasing tag order.
    pub fn process(&mut self, confirm: Confirm) -> Vec<Confirm> {
        let (payload, status) = match confirm {
            Confirm::Ack(payload) => (payload, ConfirmStatus::Ack),
            Confirm::Nack(payload) => (payload, ConfirmStatus::Nack),
        };

        if payload.multiple {
            // everything up to the tag resolves with this status
            let mut tag = self.expected_next;
            while tag <= payload.delivery_tag {
                self.pending.entry(tag).or_insert(status);
                tag += 1;
            }
        } else {
            self.pending.insert(payload.delivery_tag, status);
        }

        let mut out = Vec::new();
        while let Some(status) = self.pending.remove(&self.expected_next) {
            let payload = ConfirmPayload {
                delivery_tag: self.expected_next,
                multiple: false,
            };
            out.push(match status {
                ConfirmStatus::Ack => Confirm::Ack(payload),
                ConfirmStatus::Nack => Confirm::Nack(payload),
            });
            self.expected_next += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(delivery_tag: u64, multiple: bool) -> Confirm {
        Confirm::Ack(ConfirmPayload {
            delivery_tag,
            multiple,
        })
    }

    fn nack(delivery_tag: u64, multiple: bool) -> Confirm {
        Confirm::Nack(ConfirmPayload {
            delivery_tag,
            multiple,
        })
    }

    #[test]
    fn tracker_assigns_from_one() {
        let mut tracker = ConfirmTracker::new();
        assert_eq!(tracker.assign(None), 1);
        assert_eq!(tracker.assign(None), 2);
        assert!(tracker.is_contiguous_suffix());
    }

    #[test]
    fn single_ack_resolves_exactly_one() {
        let mut tracker = ConfirmTracker::new();
        let (tx1, h1) = ConfirmHandle::new();
        let (tx2, h2) = ConfirmHandle::new();
        tracker.assign(Some(tx1));
        tracker.assign(Some(tx2));

        tracker.resolve(1, false, true);
        assert_eq!(h1.try_wait(), Some(ConfirmStatus::Ack));
        assert_eq!(h2.try_wait(), None);
        assert_eq!(tracker.outstanding(), 1);
        assert!(tracker.is_contiguous_suffix());
    }

    #[test]
    fn cumulative_nack_resolves_prefix() {
        let mut tracker = ConfirmTracker::new();
        let handles: Vec<ConfirmHandle> = (0..4)
            .map(|_| {
                let (tx, handle) = ConfirmHandle::new();
                tracker.assign(Some(tx));
                handle
            })
            .collect();

        tracker.resolve(3, true, false);
        assert_eq!(handles[0].try_wait(), Some(ConfirmStatus::Nack));
        assert_eq!(handles[1].try_wait(), Some(ConfirmStatus::Nack));
        assert_eq!(handles[2].try_wait(), Some(ConfirmStatus::Nack));
        assert_eq!(handles[3].try_wait(), None);
        assert_eq!(tracker.outstanding(), 1);
        assert!(tracker.is_contiguous_suffix());
    }

    #[test]
    fn dropping_tracker_interrupts_waiters() {
        let mut tracker = ConfirmTracker::new();
        let (tx, handle) = ConfirmHandle::new();
        tracker.assign(Some(tx));
        drop(tracker);
        match handle.wait() {
            Err(Error::OperationInterrupted) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn detached_publish_stays_tracked() {
        let mut tracker = ConfirmTracker::new();
        let (tx, handle) = ConfirmHandle::new();
        tracker.assign(Some(tx));
        drop(handle);
        assert_eq!(tracker.outstanding(), 1);
        tracker.resolve(1, false, true);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn smoother_expands_multiple() {
        let mut smoother = ConfirmSmoother::new();
        let out = smoother.process(ack(3, true));
        assert_eq!(out, vec![ack(1, false), ack(2, false), ack(3, false)]);
    }

    #[test]
    fn smoother_buffers_out_of_order_singles() {
        let mut smoother = ConfirmSmoother::new();
        assert!(smoother.process(ack(2, false)).is_empty());
        let out = smoother.process(nack(1, false));
        assert_eq!(out, vec![nack(1, false), ack(2, false)]);
    }

    #[test]
    fn smoother_multiple_does_not_overwrite_buffered_status() {
        let mut smoother = ConfirmSmoother::new();
        assert!(smoother.process(nack(2, false)).is_empty());
        let out = smoother.process(ack(3, true));
        assert_eq!(out, vec![ack(1, false), nack(2, false), ack(3, false)]);
    }
}

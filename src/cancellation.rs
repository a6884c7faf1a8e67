use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A caller-held cancellation handle.
///
/// Cancelling races the reply of whatever operation is watching the handle:
/// if cancellation wins, the operation fails with
/// [`Error::Cancelled`](crate::Error) and the channel's RPC slot is only
/// released once the (still inbound) server reply has been observed and
/// discarded. Cancelling a publish in confirm mode detaches its completion
/// handle; the sequence number stays tracked until the server confirms it.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    /// Request cancellation. Idempotent; wakes every operation watching
    /// this handle at its next poll tick.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

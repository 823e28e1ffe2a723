//! Subscriber identity shared between the Filter, Dispatcher and State.

use std::fmt;

/// An opaque `(consumer_pid, ref)` pair identifying a subscriber to the
/// Dispatcher.
///
/// This core has no OS process boundary between consumers — they are tokio
/// tasks — so `consumer` stands in for the pid and `generation` for the
/// monitor ref: a consumer that restarts gets a new `generation`, which is
/// enough to let the Dispatcher tell a stale subscription from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId {
    pub consumer: u64,
    pub generation: u64,
}

impl SubscriberId {
    pub fn new(consumer: u64, generation: u64) -> Self {
        Self { consumer, generation }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.consumer, self.generation)
    }
}

//! The upstream replication producer contract.
//!
//! Postgres connection management and replication-slot handling are out of
//! scope for this core; [`LogCollector`] is the named interface the
//! Dispatcher drives instead. Plays the same "turn wire bytes into typed
//! payload events" role as
//! `backend::replication::logical::subscriber::stream::StreamSubscriber::handle`,
//! minus the actual wire decoding.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::change::Change;

/// One upstream replication event: `{transaction_start, lsn}`,
/// `{changes, op_index_range, is_final}`, `{commit, lsn}`,
/// `{relation, schema}`.
///
/// A `{relation, schema}` schema announcement rides inside `Fragment` as an
/// ordinary [`Change::Relation`] — it still needs an `op_index` slot in the
/// per-transaction ordering, so it isn't worth a fifth variant here.
#[derive(Debug, Clone)]
pub enum Event {
    TransactionStart {
        lsn: u64,
    },
    /// A contiguous run of changes belonging to the currently-open
    /// transaction. `is_final` marks the last fragment before the commit
    /// marker; fragments never split across transactions.
    Fragment {
        lsn: u64,
        changes: Vec<Change>,
        is_final: bool,
    },
    Commit {
        lsn: u64,
    },
}

impl Event {
    pub fn lsn(&self) -> u64 {
        match self {
            Event::TransactionStart { lsn } => *lsn,
            Event::Fragment { lsn, .. } => *lsn,
            Event::Commit { lsn } => *lsn,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("replication disconnected: {0}")]
    Disconnected(String),
}

/// The single upstream producer the Dispatcher asks for events.
///
/// Demand grammar: one unit of demand (`ask(1)`) returns exactly one event,
/// or `Ok(None)` once the stream is exhausted (used only in tests — a live
/// replication stream never legitimately ends).
#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn ask(&self, n: u32) -> Result<Option<Event>, ProducerError>;
}

/// Deterministic producer used by this crate's own tests: replays a fixed
/// sequence of events, one per `ask(1)`.
pub struct TestProducer {
    events: Mutex<VecDeque<Event>>,
}

impl TestProducer {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events.into()),
        }
    }
}

#[async_trait]
impl LogCollector for TestProducer {
    async fn ask(&self, _n: u32) -> Result<Option<Event>, ProducerError> {
        Ok(self.events.lock().await.pop_front())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order() {
        let producer = TestProducer::new(vec![
            Event::TransactionStart { lsn: 1 },
            Event::Commit { lsn: 1 },
        ]);
        assert!(matches!(
            producer.ask(1).await.unwrap(),
            Some(Event::TransactionStart { lsn: 1 })
        ));
        assert!(matches!(
            producer.ask(1).await.unwrap(),
            Some(Event::Commit { lsn: 1 })
        ));
        assert!(producer.ask(1).await.unwrap().is_none());
    }
}

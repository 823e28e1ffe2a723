//! Per-inner-shape in-memory materialization, observable only at commit
//! boundaries.
//!
//! Grounded on `backend::pub_sub::inner::Inner`'s `broadcast::Sender` fan-out
//! to subscribers, adapted from raw passthrough to snapshot + delta: a
//! `tokio::sync::broadcast` channel carries [`Delta`]s instead of raw
//! notifications, and the row-set itself lives behind a `parking_lot::Mutex`
//! rather than a lock-free structure since it's written from exactly one
//! place (commit application) and read from subscribe + delta computation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::change::{Change, Offset, Value};
use crate::storage::{Storage, StorageError};

pub type RowSet = HashMap<Value, crate::change::Tuple>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("offset {0} has not been committed yet")]
    OffsetNotCommitted(Offset),
    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// A commit-boundary move-in/move-out notification.
#[derive(Debug, Clone)]
pub struct Delta {
    pub commit_lsn: u64,
    /// Key-column values that newly satisfy the inner shape.
    pub entered: Vec<Value>,
    /// Key-column values that no longer satisfy the inner shape.
    pub left: Vec<Value>,
}

struct Inner {
    rows: Mutex<RowSet>,
    pending: Mutex<Vec<Change>>,
    key_column: String,
    storage: Arc<dyn Storage>,
    deltas: broadcast::Sender<Delta>,
}

/// One per inner shape. Holds the shape's current row-set in memory keyed
/// by `key_column`, and notifies subscribed outer consumers of move-in/
/// move-out deltas at commit boundaries.
#[derive(Clone)]
pub struct Materializer {
    inner: Arc<Inner>,
}

impl Materializer {
    pub fn new(key_column: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let capacity = crate::config::config().materializer_channel_capacity;
        let (deltas, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                rows: Mutex::new(RowSet::new()),
                pending: Mutex::new(Vec::new()),
                key_column: key_column.into(),
                storage,
                deltas,
            }),
        }
    }

    /// Returns the row-set at or before `from_offset`, plus a subscription
    /// to future commit-boundary deltas. Rejects a request for a
    /// non-committed offset (see [`crate::state::State::initialize_shape`]
    /// for the caller-side half of this contract).
    pub async fn subscribe(
        &self,
        from_offset: Offset,
    ) -> Result<(RowSet, broadcast::Receiver<Delta>), Error> {
        let committed = self.inner.storage.fetch_latest_committed_offset().await?;
        if from_offset > committed {
            return Err(Error::OffsetNotCommitted(from_offset));
        }
        let snapshot = self.inner.rows.lock().clone();
        Ok((snapshot, self.inner.deltas.subscribe()))
    }

    /// A snapshot of the current committed row-set, without subscribing.
    pub fn snapshot(&self) -> RowSet {
        self.inner.rows.lock().clone()
    }

    /// `commit = false`: journal `changes` without applying them or
    /// notifying anyone. `commit = true`: atomically apply everything
    /// journaled since the last commit, compute the delta, and notify.
    pub fn handle_changes(&self, commit_lsn: u64, changes: Vec<Change>, commit: bool) {
        if !commit {
            self.inner.pending.lock().extend(changes);
            return;
        }

        let mut pending = self.inner.pending.lock();
        pending.extend(changes);
        let batch = std::mem::take(&mut *pending);
        drop(pending);

        let mut rows = self.inner.rows.lock();
        let mut entered = Vec::new();
        let mut left = Vec::new();

        for change in batch {
            self.apply(&mut rows, change, &mut entered, &mut left);
        }
        drop(rows);

        // Always broadcast, even when nothing moved: an outer consumer
        // waits for the delta whose `commit_lsn` matches its own
        // transaction to know the inner materializer has caught up to the
        // same commit boundary (see `Consumer::convert_for_subquery`). A
        // broadcast with no receivers just errors silently, which is the
        // normal state for an inner shape with no outer subscribers yet.
        let _ = self.inner.deltas.send(Delta {
            commit_lsn,
            entered,
            left,
        });
    }

    fn apply(
        &self,
        rows: &mut RowSet,
        change: Change,
        entered: &mut Vec<Value>,
        left: &mut Vec<Value>,
    ) {
        let key_column = self.inner.key_column.as_str();
        match change {
            Change::Insert { new, .. } => {
                if let Some(key) = new.get(key_column).cloned() {
                    if rows.insert(key.clone(), new).is_none() {
                        entered.push(key);
                    }
                }
            }
            Change::Update { old, new, .. } => {
                let old_key = old.as_ref().and_then(|t| t.get(key_column).cloned());
                let new_key = new.get(key_column).cloned();
                if old_key != new_key {
                    if let Some(old_key) = old_key {
                        if rows.remove(&old_key).is_some() {
                            left.push(old_key);
                        }
                    }
                    if let Some(new_key) = new_key.clone() {
                        if rows.insert(new_key.clone(), new.clone()).is_none() {
                            entered.push(new_key);
                        }
                    }
                } else if let Some(key) = new_key {
                    rows.insert(key, new);
                }
            }
            Change::Delete { old, .. } => {
                if let Some(key) = old.get(key_column).cloned() {
                    if rows.remove(&key).is_some() {
                        left.push(key);
                    }
                }
            }
            Change::Truncate { .. } => {
                for key in rows.keys().cloned().collect::<Vec<_>>() {
                    left.push(key);
                }
                rows.clear();
            }
            Change::Relation { .. } => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::change::Tuple;
    use crate::relation::Relation;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    async fn materializer() -> (TempDir, Materializer) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        (dir, Materializer::new("x_id", storage))
    }

    fn insert(key: i64) -> Change {
        let mut tuple = Tuple::new();
        tuple.insert("x_id".into(), Value::Int(key));
        Change::Insert {
            relation: Relation::public("x"),
            op_index: 0,
            new: tuple,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_changes_not_visible() {
        let (_dir, mat) = materializer().await;
        mat.handle_changes(1, vec![insert(1)], false);
        assert!(mat.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_and_notifies() {
        let (_dir, mat) = materializer().await;
        let mut rx = mat.inner.deltas.subscribe();
        mat.handle_changes(1, vec![insert(1), insert(2)], false);
        mat.handle_changes(1, vec![], true);

        assert_eq!(mat.snapshot().len(), 2);
        let delta = rx.recv().await.unwrap();
        assert_eq!(delta.commit_lsn, 1);
        assert_eq!(delta.entered.len(), 2);
        assert!(delta.left.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_uncommitted_offset() {
        let (_dir, mat) = materializer().await;
        let err = mat.subscribe(Offset::new(5, 0)).await.unwrap_err();
        assert!(matches!(err, Error::OffsetNotCommitted(_)));
    }

    #[tokio::test]
    async fn test_delete_after_insert_leaves() {
        let (_dir, mat) = materializer().await;
        mat.handle_changes(1, vec![insert(1)], true);
        assert_eq!(mat.snapshot().len(), 1);

        let delete = Change::Delete {
            relation: Relation::public("x"),
            op_index: 0,
            old: {
                let mut t = Tuple::new();
                t.insert("x_id".into(), Value::Int(1));
                t
            },
        };
        let mut rx = mat.inner.deltas.subscribe();
        mat.handle_changes(2, vec![delete], true);
        assert!(mat.snapshot().is_empty());
        let delta = rx.recv().await.unwrap();
        assert_eq!(delta.left, vec![Value::Int(1)]);
    }
}

//! Per-shape consumer: owns a shape's log, converts raw changes into shape
//! operations, and implements both write units.
//!
//! Grounded on
//! `backend::replication::logical::subscriber::stream::StreamSubscriber`'s
//! per-table statement cache plus commit-boundary flush pattern
//! (`insert`/`update`/`delete`/`commit`), adapted from "apply to Postgres"
//! to "append to local log". Each Consumer owns its state outright and runs
//! on its own spawned task — nothing else touches it — so unlike
//! `Dispatcher`/`Materializer` there's no `Arc<Mutex<_>>` here at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

use crate::change::{Change, Tuple, Value};
use crate::dispatcher::Dispatcher;
use crate::materializer::{Delta, Materializer};
use crate::producer::Event;
use crate::shape::{Predicate, Shape};
use crate::storage::{Storage, StorageError};
use crate::subscriber::SubscriberId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage append failed: {0}")]
    StorageAppendFailed(#[from] StorageError),
    #[error("inner materializer's delta channel closed")]
    MaterializerClosed,
    #[error("{0}")]
    Materializer(#[from] crate::materializer::Error),
}

/// Granularity at which a [`Consumer`] writes to storage; fixed for the
/// lifetime of the consumer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteUnit {
    /// Buffer the entire transaction in memory; append + advance the
    /// committed watermark atomically on commit.
    Txn,
    /// Append each fragment immediately; advance the committed watermark
    /// only on the commit marker.
    TxnFragment,
}

/// Wiring to this outer shape's one inner dependency. A shape's
/// `Predicate::Subquery` names exactly one inner shape, so this core
/// supports one dependency per outer shape rather than an arbitrary
/// dependency graph fan-in.
pub struct Dependency {
    pub materializer: Materializer,
    pub delta_rx: broadcast::Receiver<Delta>,
}

pub struct Consumer {
    id: SubscriberId,
    shape: Shape,
    storage: Arc<dyn Storage>,
    write_unit: WriteUnit,
    dispatcher: Dispatcher,
    /// Set when this shape is itself an inner shape with outer
    /// subscribers: every committed batch of changes is forwarded here.
    materializer: Option<Materializer>,
    dependency: Option<Dependency>,
    /// `txn` mode only: changes accumulated since the last commit.
    buffer: Vec<Change>,
    /// Shadow copy of every row ever observed on the outer relation, keyed
    /// by the subquery's join column, used to resolve move-in/move-out
    /// triggered purely by a change to the *inner* shape (no accompanying
    /// Change on the outer relation itself in that transaction).
    known_outer_rows: HashMap<Value, Tuple>,
    /// Millis-since-process-start timestamp of the last event this
    /// consumer started handling, for the supervisor's slow-consumer
    /// watchdog.
    heartbeat: Arc<AtomicU64>,
}

/// Monotonic process-local clock the heartbeat is measured against —
/// `Instant` itself isn't `Copy`-into-an-atomic, so every consumer stamps
/// its heartbeat as millis elapsed since this one shared origin.
static CLOCK_START: Lazy<Instant> = Lazy::new(Instant::now);

pub fn now_millis() -> u64 {
    CLOCK_START.elapsed().as_millis() as u64
}

/// Sentinel heartbeat value meaning "no event currently in flight" —
/// distinct from any real `now_millis()` reading, so the watchdog never
/// mistakes a consumer idling on an empty channel for one stuck mid-handle.
pub const HEARTBEAT_IDLE: u64 = u64::MAX;

/// Read-side handle to a shape's consumer, independent of the consumer
/// task's own lifetime — a crash-and-restart swaps out the task but reopens
/// the same storage directory, so this handle's offsets keep advancing
/// across that restart without the reader needing to resubscribe.
///
/// This is the interface an external shape API is expected to call:
/// `latest_offset`/`latest_committed_offset` for the shape's current tail,
/// `read_since` for the committed-only change stream a `GET
/// /shape/{handle}?offset=X` request serves, and `subscribe_materializer`
/// for an outer shape wiring up a new dependency.
#[derive(Clone)]
pub struct ConsumerHandle {
    storage: Arc<dyn Storage>,
    materializer: Option<Materializer>,
}

impl ConsumerHandle {
    pub fn new(storage: Arc<dyn Storage>, materializer: Option<Materializer>) -> Self {
        Self { storage, materializer }
    }

    pub async fn latest_offset(&self) -> Result<crate::change::Offset, StorageError> {
        self.storage.fetch_latest_offset().await
    }

    pub async fn latest_committed_offset(&self) -> Result<crate::change::Offset, StorageError> {
        self.storage.fetch_latest_committed_offset().await
    }

    /// Committed changes strictly after `from_offset`, serving a
    /// `GET /shape/{handle}?offset=X` request.
    pub async fn read_since(
        &self,
        from_offset: crate::change::Offset,
    ) -> Result<crate::storage::ReadStream, StorageError> {
        self.storage.read_committed(from_offset).await
    }

    /// `Some` only for an inner shape (one with at least one outer
    /// dependent); `None` for a shape nothing has ever subscribed to.
    pub async fn subscribe_materializer(
        &self,
        from_offset: crate::change::Offset,
    ) -> Result<Option<(crate::materializer::RowSet, broadcast::Receiver<Delta>)>, Error> {
        let Some(materializer) = &self.materializer else {
            return Ok(None);
        };
        Ok(Some(materializer.subscribe(from_offset).await?))
    }
}

impl Consumer {
    /// Spawns the consumer task and returns its event channel, a heartbeat
    /// the supervisor's slow-consumer watchdog can poll, and a handle that
    /// completes when the task exits, however it exits (clean shutdown via
    /// channel close, or a crash on storage-append failure). A supervisor
    /// (see [`crate::state::State`]) distinguishes the two by
    /// whether it asked this shape to stop before the handle completed.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: SubscriberId,
        shape: Shape,
        storage: Arc<dyn Storage>,
        write_unit: WriteUnit,
        dispatcher: Dispatcher,
        materializer: Option<Materializer>,
        dependency: Option<Dependency>,
    ) -> (
        mpsc::Sender<Arc<Event>>,
        Arc<AtomicU64>,
        tokio::task::JoinHandle<()>,
        ConsumerHandle,
    ) {
        let (tx, rx) = mpsc::channel(Dispatcher::consumer_channel_capacity());
        let heartbeat = Arc::new(AtomicU64::new(HEARTBEAT_IDLE));
        let reader = ConsumerHandle::new(storage.clone(), materializer.clone());
        let consumer = Consumer {
            id,
            shape,
            storage,
            write_unit,
            dispatcher,
            materializer,
            dependency,
            buffer: Vec::new(),
            known_outer_rows: HashMap::new(),
            heartbeat: heartbeat.clone(),
        };
        let handle = tokio::spawn(consumer.run(rx));
        (tx, heartbeat, handle, reader)
    }

    async fn run(mut self, mut events: mpsc::Receiver<Arc<Event>>) {
        while let Some(event) = events.recv().await {
            // Idle time (waiting on `events.recv()`) never counts against
            // the slow-consumer watchdog; only mark a heartbeat once an
            // event is actually in flight, and clear it back to `IDLE`
            // once it's been durably handled.
            self.heartbeat.store(now_millis(), Ordering::Relaxed);
            let result = self.handle(&event).await;
            match result {
                Ok(()) => {
                    self.dispatcher.ask(self.id);
                    self.heartbeat.store(HEARTBEAT_IDLE, Ordering::Relaxed);
                }
                Err(err) => {
                    // A storage-append failure is fatal to the consumer.
                    // No ack is sent — the Dispatcher notices this
                    // consumer is gone once its channel closes, and
                    // supervision is expected to restart it, replaying
                    // from the last committed offset.
                    error!(shape = %self.shape.handle(), "consumer crashed: {err}");
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, event: &Event) -> Result<(), Error> {
        match (event, self.write_unit) {
            (Event::TransactionStart { .. }, _) => {
                self.buffer.clear();
                Ok(())
            }
            (Event::Fragment { changes, .. }, WriteUnit::Txn) => {
                // A subquery shape is also indexed under its inner
                // relation so it's routed the commit marker for a
                // transaction that never touched its own relation; only
                // buffer the changes that are actually on its own
                // relation, the rest are handled via the materializer
                // delta in `convert_for_subquery`.
                self.buffer.extend(
                    changes
                        .iter()
                        .filter(|c| c.relation() == &self.shape.relation)
                        .cloned(),
                );
                Ok(())
            }
            (Event::Fragment { lsn, changes, .. }, WriteUnit::TxnFragment) => {
                self.write_txn_fragment_to_storage(*lsn, changes).await
            }
            (Event::Commit { lsn }, WriteUnit::Txn) => self.complete_txn_buffer(*lsn).await,
            (Event::Commit { lsn }, WriteUnit::TxnFragment) => {
                self.maybe_complete_pending_txn(*lsn).await
            }
        }
    }

    /// `txn_fragment` fragment handling: append immediately, advancing only
    /// `latest_offset`, and pre-journal into the materializer if this is an
    /// inner shape.
    async fn write_txn_fragment_to_storage(
        &mut self,
        lsn: u64,
        changes: &[Change],
    ) -> Result<(), Error> {
        if changes.is_empty() {
            return Ok(());
        }
        self.storage.append(lsn, changes).await?;
        if let Some(materializer) = &self.materializer {
            materializer.handle_changes(lsn, changes.to_vec(), false);
        }
        Ok(())
    }

    /// `txn_fragment` commit handling: advance the committed watermark and
    /// flush the materializer's deferred events.
    async fn maybe_complete_pending_txn(&mut self, lsn: u64) -> Result<(), Error> {
        let latest = self.storage.fetch_latest_offset().await?;
        if latest.txn_lsn == lsn {
            self.storage.commit(latest).await?;
        }
        if let Some(materializer) = &self.materializer {
            materializer.handle_changes(lsn, Vec::new(), true);
        }
        Ok(())
    }

    /// `txn` commit handling: run subquery conversion if this is an outer
    /// shape, then append + commit the whole transaction atomically. A
    /// subquery shape must still run conversion on an empty buffer — a
    /// transaction that only touched its inner relation still needs to
    /// resolve move-in/move-out against the inner shape's delta for this
    /// commit.
    async fn complete_txn_buffer(&mut self, lsn: u64) -> Result<(), Error> {
        let changes = std::mem::take(&mut self.buffer);
        if changes.is_empty() && !self.shape.is_subquery_shape() {
            return Ok(());
        }

        let converted = if self.shape.is_subquery_shape() {
            self.convert_for_subquery(lsn, changes).await?
        } else {
            changes
        };

        if !converted.is_empty() {
            let latest = self.storage.append(lsn, &converted).await?;
            self.storage.commit(latest).await?;
        }

        if let Some(materializer) = &self.materializer {
            materializer.handle_changes(lsn, converted, false);
            materializer.handle_changes(lsn, Vec::new(), true);
        }
        Ok(())
    }

    /// For each inbound change on the outer relation, consult the inner
    /// shape's materialization as of this transaction's commit to decide
    /// whether the row enters, leaves, stays inside, or stays outside the
    /// outer shape. Also accounts for rows that move purely because the
    /// *inner* shape changed, with no accompanying outer-relation Change
    /// this txn.
    async fn convert_for_subquery(
        &mut self,
        lsn: u64,
        changes: Vec<Change>,
    ) -> Result<Vec<Change>, Error> {
        let Predicate::Subquery { column, .. } = self.shape.predicate.clone() else {
            return Ok(changes);
        };
        let Some(dependency) = self.dependency.as_mut() else {
            warn!(shape = %self.shape.handle(), "subquery shape has no wired dependency; passing changes through");
            return Ok(changes);
        };

        // Block until the inner materializer has applied this exact
        // commit, so the snapshot below is transactionally consistent
        // with what this outer transaction should see.
        let delta = loop {
            let delta = dependency
                .delta_rx
                .recv()
                .await
                .map_err(|_| Error::MaterializerClosed)?;
            if delta.commit_lsn >= lsn {
                break delta;
            }
        };
        let inner_rows = dependency.materializer.snapshot();

        let mut out = Vec::new();
        for change in changes {
            self.convert_one(&column, &inner_rows, change, &mut out);
        }

        for key in &delta.entered {
            if let Some(tuple) = self.known_outer_rows.get(key) {
                if !touches(&out, &column, key) {
                    out.push(Change::Insert {
                        relation: self.shape.relation.clone(),
                        op_index: 0,
                        new: tuple.clone(),
                    });
                }
            }
        }
        for key in &delta.left {
            if let Some(tuple) = self.known_outer_rows.get(key) {
                if !touches(&out, &column, key) {
                    out.push(Change::Delete {
                        relation: self.shape.relation.clone(),
                        op_index: 0,
                        old: tuple.clone(),
                    });
                }
            }
        }

        Ok(renumber(out))
    }

    fn convert_one(
        &mut self,
        column: &str,
        inner_rows: &crate::materializer::RowSet,
        change: Change,
        out: &mut Vec<Change>,
    ) {
        match change {
            Change::Insert {
                relation,
                op_index,
                new,
            } => {
                let key = new.get(column).cloned();
                if let Some(key) = key.clone() {
                    self.known_outer_rows.insert(key, new.clone());
                }
                if key.is_some_and(|k| inner_rows.contains_key(&k)) {
                    out.push(Change::Insert {
                        relation,
                        op_index,
                        new,
                    });
                }
            }
            Change::Update {
                relation,
                op_index,
                old,
                new,
            } => {
                let old_key = old.as_ref().and_then(|t| t.get(column).cloned());
                let new_key = new.get(column).cloned();
                if let Some(key) = new_key.clone() {
                    self.known_outer_rows.insert(key, new.clone());
                }
                let old_in = old_key.is_some_and(|k| inner_rows.contains_key(&k));
                let new_in = new_key.is_some_and(|k| inner_rows.contains_key(&k));
                match (old_in, new_in) {
                    (false, true) => out.push(Change::Insert {
                        relation,
                        op_index,
                        new,
                    }),
                    (true, false) => {
                        if let Some(old) = old {
                            out.push(Change::Delete {
                                relation,
                                op_index,
                                old,
                            });
                        }
                    }
                    (true, true) => out.push(Change::Update {
                        relation,
                        op_index,
                        old,
                        new,
                    }),
                    (false, false) => {}
                }
            }
            Change::Delete {
                relation,
                op_index,
                old,
            } => {
                let key = old.get(column).cloned();
                if let Some(key) = &key {
                    self.known_outer_rows.remove(key);
                }
                if key.is_some_and(|k| inner_rows.contains_key(&k)) {
                    out.push(Change::Delete {
                        relation,
                        op_index,
                        old,
                    });
                }
            }
            Change::Truncate { relation, op_index } => {
                self.known_outer_rows.clear();
                out.push(Change::Truncate { relation, op_index });
            }
            Change::Relation { .. } => {}
        }
    }
}

/// Subscribes an outer consumer to its inner shape's materializer.
///
/// Always anchors on `fetch_latest_committed_offset()`, never
/// `latest_offset()` — a consumer that subscribed against an uncommitted
/// offset could observe a materializer snapshot ahead of what its own
/// storage has durably recorded.
pub async fn subscribe_materializer(
    materializer: &Materializer,
    own_storage: &dyn Storage,
) -> Result<(crate::materializer::RowSet, broadcast::Receiver<Delta>), Error> {
    let from_offset = own_storage.fetch_latest_committed_offset().await?;
    Ok(materializer.subscribe(from_offset).await?)
}

fn touches(out: &[Change], column: &str, key: &Value) -> bool {
    out.iter().any(|c| match c {
        Change::Insert { new, .. } => new.get(column) == Some(key),
        Change::Update { new, .. } => new.get(column) == Some(key),
        Change::Delete { old, .. } => old.get(column) == Some(key),
        _ => false,
    })
}

/// Reassigns sequential `op_index`s across a converted/synthesized batch:
/// dropped changes leave gaps, and synthesized move-in/move-out ops have no
/// original index of their own, so the batch is renumbered wholesale.
fn renumber(changes: Vec<Change>) -> Vec<Change> {
    changes
        .into_iter()
        .enumerate()
        .map(|(i, c)| with_op_index(c, i as u32))
        .collect()
}

fn with_op_index(change: Change, op_index: u32) -> Change {
    match change {
        Change::Insert { relation, new, .. } => Change::Insert {
            relation,
            op_index,
            new,
        },
        Change::Update {
            relation, old, new, ..
        } => Change::Update {
            relation,
            op_index,
            old,
            new,
        },
        Change::Delete { relation, old, .. } => Change::Delete {
            relation,
            op_index,
            old,
        },
        Change::Truncate { relation, .. } => Change::Truncate { relation, op_index },
        Change::Relation {
            relation, parent, ..
        } => Change::Relation {
            relation,
            op_index,
            parent,
        },
    }
}

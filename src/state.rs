//! Registry and supervisor: instantiates consumers and materializers,
//! chooses the initial `write_unit` for each shape, tracks shape
//! dependencies, and restarts crashed tasks.
//!
//! Grounded on `backend::pub_sub::listener::Listener`'s restart-on-error
//! task loop (a supervising task that re-spawns its worker via a
//! `Notify`-driven `select!` loop on error) and `config::mod.rs`'s
//! `ArcSwap`-backed global registry idiom, here realized per-shape with
//! `dashmap::DashMap` instead of a single global `ArcSwap` since shapes are
//! added/removed far more often than the whole config snapshot is replaced.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::consumer::{Consumer, ConsumerHandle, Dependency, WriteUnit};
use crate::dispatcher::Dispatcher;
use crate::materializer::Materializer;
use crate::shape::{Shape, ShapeHandle};
use crate::storage::{FileStorage, Storage, StorageError};
use crate::subscriber::SubscriberId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape dependency graph has a cycle through {0}")]
    DependencyCycle(ShapeHandle),
    #[error("shape {0} depends on unknown shape {1}")]
    UnknownDependency(ShapeHandle, ShapeHandle),
    #[error("shape {0} is already registered")]
    AlreadyRegistered(ShapeHandle),
    #[error("shape {0} is not registered")]
    NotFound(ShapeHandle),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] crate::dispatcher::Error),
    #[error("materializer error: {0}")]
    Materializer(#[from] crate::materializer::Error),
}

/// Opens (or re-opens, across a restart) the [`Storage`] backing one shape.
/// A trait rather than a bare function so tests can substitute an in-memory
/// implementation without touching the filesystem.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn open(&self, handle: &ShapeHandle) -> Result<Arc<dyn Storage>, StorageError>;
}

/// [`StorageFactory`] backed by [`FileStorage`], one directory per shape
/// under `root`.
pub struct FileStorageFactory {
    root: PathBuf,
}

impl FileStorageFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageFactory for FileStorageFactory {
    async fn open(&self, handle: &ShapeHandle) -> Result<Arc<dyn Storage>, StorageError> {
        let dir = self.root.join(handle.as_str());
        Ok(Arc::new(FileStorage::open(dir).await?))
    }
}

struct Entry {
    shape: Shape,
    subscriber: SubscriberId,
    write_unit: WriteUnit,
    materializer: Option<Materializer>,
    /// Read-side handle for an external shape API or other reader:
    /// survives a crash-and-restart of the underlying consumer task
    /// untouched, since it talks to storage/materializer directly rather
    /// than the task.
    reader: ConsumerHandle,
    /// Signaled to tell the supervisor loop for this shape to stop
    /// respawning instead of treating the next task exit as a crash.
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// Chooses `write_unit`: outer (dependency-bearing) shapes always get
/// `Txn`, since subquery conversion needs the whole committed transaction
/// available at once; everything else defaults to `TxnFragment`.
pub fn select_write_unit(shape: &Shape) -> WriteUnit {
    if shape.has_dependencies() {
        WriteUnit::Txn
    } else {
        WriteUnit::TxnFragment
    }
}

/// Registry and supervisor owning every live shape's consumer (and, for
/// inner shapes, materializer) task.
pub struct State {
    dispatcher: Dispatcher,
    storage: Arc<dyn StorageFactory>,
    entries: DashMap<ShapeHandle, Entry>,
    next_consumer_id: AtomicU64,
}

impl State {
    /// Constructs the registry. Returned as an `Arc` because a restarted
    /// consumer's supervisor loop needs to call back into `State` to
    /// rebuild the crashed shape's task, the same reason
    /// `pub_sub::listener::Listener` wraps its own state in `Arc<Inner>`
    /// before spawning its restart loop.
    pub fn new(dispatcher: Dispatcher, storage: Arc<dyn StorageFactory>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            storage,
            entries: DashMap::new(),
            next_consumer_id: AtomicU64::new(1),
        })
    }

    pub fn is_registered(&self, handle: &ShapeHandle) -> bool {
        self.entries.contains_key(handle)
    }

    pub fn write_unit_of(&self, handle: &ShapeHandle) -> Option<WriteUnit> {
        self.entries.get(handle).map(|e| e.write_unit)
    }

    /// The read-side handle a shape API or reader would use to serve
    /// `latest_offset`/`latest_committed_offset`/`read_since`/
    /// `subscribe_materializer` for `handle`. Stays valid across a consumer
    /// crash-and-restart for the same shape.
    pub fn reader(&self, handle: &ShapeHandle) -> Option<ConsumerHandle> {
        self.entries.get(handle).map(|e| e.reader.clone())
    }

    /// Registers and starts a batch of shapes together, in dependency order
    /// (leaves first), rejecting the whole batch if it contains a cycle or
    /// an unresolvable dependency: the dependency graph must be a DAG, and
    /// creation that would introduce a cycle is rejected outright.
    ///
    /// A shape already registered from a prior call may be named as a
    /// dependency of a new shape in this batch without being included in
    /// `shapes` again.
    pub async fn create_shapes(self: &Arc<Self>, shapes: Vec<Shape>) -> Result<Vec<ShapeHandle>, Error> {
        let order = topological_order(&shapes, |h| self.is_registered(h))?;
        let mut started = Vec::with_capacity(order.len());
        for shape in order {
            let handle = self.initialize_shape(shape).await?;
            started.push(handle);
        }
        Ok(started)
    }

    /// Starts a single shape. Its `shape_dependencies` must already be
    /// registered — callers with a batch of mutually-new shapes should go
    /// through [`State::create_shapes`] instead, which topologically sorts
    /// first.
    pub async fn initialize_shape(self: &Arc<Self>, shape: Shape) -> Result<ShapeHandle, Error> {
        let handle = shape.handle().clone();
        if self.entries.contains_key(&handle) {
            return Err(Error::AlreadyRegistered(handle));
        }
        for dep in &shape.shape_dependencies {
            if !self.entries.contains_key(dep) {
                return Err(Error::UnknownDependency(handle.clone(), dep.clone()));
            }
        }

        let write_unit = select_write_unit(&shape);
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = SubscriberId::new(consumer_id, 0);

        let (materializer, task, stop, stopped, reader) =
            self.start_consumer(handle.clone(), subscriber, shape.clone(), write_unit).await?;

        info!(shape = %handle, ?write_unit, "shape started");
        self.entries.insert(
            handle.clone(),
            Entry {
                shape,
                subscriber,
                write_unit,
                materializer: Some(materializer),
                reader,
                stop,
                stopped,
                task,
            },
        );
        Ok(handle)
    }

    /// Builds storage, materializer, and (for a subquery shape) the
    /// dependency wiring for `shape`, then spawns its supervised consumer
    /// task. Shared between first-time startup and post-crash restart, so
    /// a restart goes through exactly the same construction path and lands
    /// on the same storage directory (hence `latest_committed_offset`).
    #[allow(clippy::type_complexity)]
    async fn start_consumer(
        self: &Arc<Self>,
        handle: ShapeHandle,
        subscriber: SubscriberId,
        shape: Shape,
        write_unit: WriteUnit,
    ) -> Result<
        (
            Materializer,
            tokio::task::JoinHandle<()>,
            Arc<Notify>,
            Arc<AtomicBool>,
            ConsumerHandle,
        ),
        Error,
    > {
        let storage = self.storage.open(&handle).await?;

        // An inner shape (one with outer subscribers) gets a materializer
        // fed from its own consumer's committed writes; this shape's own
        // status as "inner" isn't knowable until some later shape declares
        // a dependency on it, so every shape is given one eagerly and it
        // simply goes unused if nothing ever subscribes.
        let materializer = Materializer::new(primary_key_column(&shape), storage.clone());

        let dependency = match shape.shape_dependencies.first() {
            Some(inner_handle) => {
                let inner_materializer = self
                    .entries
                    .get(inner_handle)
                    .and_then(|inner| inner.materializer.clone())
                    .ok_or_else(|| Error::UnknownDependency(handle.clone(), inner_handle.clone()))?;
                let (_snapshot, delta_rx) =
                    crate::consumer::subscribe_materializer(&inner_materializer, storage.as_ref()).await?;
                Some(Dependency {
                    materializer: inner_materializer,
                    delta_rx,
                })
            }
            None => None,
        };

        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let (task, reader) = self
            .spawn_supervised(
                handle,
                subscriber,
                shape,
                storage,
                write_unit,
                materializer.clone(),
                dependency,
                stop.clone(),
                stopped.clone(),
            )
            .await?;

        Ok((materializer, task, stop, stopped, reader))
    }

    /// Spawns the consumer, subscribes it to the Dispatcher, and wraps both
    /// in a supervisor task that, on an unexpected exit, calls back into
    /// `State` to rebuild and re-subscribe a fresh consumer against the same
    /// shape (replaying from `latest_committed_offset`, since storage is
    /// reopened against the same directory) — until [`State::remove_shape`]
    /// signals it to stop instead.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_supervised(
        self: &Arc<Self>,
        handle: ShapeHandle,
        subscriber: SubscriberId,
        shape: Shape,
        storage: Arc<dyn Storage>,
        write_unit: WriteUnit,
        materializer: Materializer,
        dependency: Option<Dependency>,
        stop: Arc<Notify>,
        stopped: Arc<AtomicBool>,
    ) -> Result<(tokio::task::JoinHandle<()>, ConsumerHandle), Error> {
        let dispatcher = self.dispatcher.clone();
        let (sender, heartbeat, consumer_handle, reader) = Consumer::spawn(
            subscriber,
            shape.clone(),
            storage,
            write_unit,
            dispatcher.clone(),
            Some(materializer),
            dependency,
        );
        dispatcher.subscribe(subscriber, shape, sender).await?;

        let slow_timeout = crate::config::config().dispatcher_slow_consumer_timeout();
        let state = self.clone();
        let supervisor = tokio::spawn(async move {
            let mut consumer_handle = consumer_handle;
            // Polled at a fraction of the timeout so a stuck consumer is
            // noticed promptly without busy-looping.
            let mut watchdog = tokio::time::interval((slow_timeout / 4).max(std::time::Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = &mut consumer_handle => {
                        if stopped.load(Ordering::Acquire) {
                            return;
                        }
                        error!(shape = %handle, subscriber = %subscriber, "consumer task exited unexpectedly, restarting");
                        match state.restart_shape(&handle).await {
                            Ok(()) => return,
                            Err(err) => {
                                error!(shape = %handle, "failed to restart crashed consumer: {err}");
                                return;
                            }
                        }
                    }
                    _ = stop.notified() => {
                        stopped.store(true, Ordering::Release);
                        return;
                    }
                    _ = watchdog.tick() => {
                        let in_flight_since = heartbeat.load(Ordering::Relaxed);
                        if in_flight_since != crate::consumer::HEARTBEAT_IDLE {
                            let busy_for = crate::consumer::now_millis().saturating_sub(in_flight_since);
                            if busy_for as u128 > slow_timeout.as_millis() {
                                error!(shape = %handle, subscriber = %subscriber, busy_ms = busy_for, "consumer stalled past slow-consumer timeout, terminating for restart");
                                consumer_handle.abort();
                            }
                        }
                    }
                }
            }
        });
        Ok((supervisor, reader))
    }

    /// Rebuilds and restarts the supervised task backing `handle`, replacing
    /// its entry's task/stop/stopped handles in place. The generation on the
    /// new `SubscriberId` is bumped so the Dispatcher can tell this fresh
    /// subscription apart from the stale one it is about to notice is gone.
    async fn restart_shape(self: &Arc<Self>, handle: &ShapeHandle) -> Result<(), Error> {
        let (shape, write_unit, old_subscriber) = {
            let entry = self.entries.get(handle).ok_or_else(|| Error::NotFound(handle.clone()))?;
            (entry.shape.clone(), entry.write_unit, entry.subscriber)
        };
        self.dispatcher.cancel(old_subscriber);

        let subscriber = SubscriberId::new(old_subscriber.consumer, old_subscriber.generation + 1);
        let (materializer, task, stop, stopped, reader) = self
            .start_consumer(handle.clone(), subscriber, shape.clone(), write_unit)
            .await?;

        if let Some(mut entry) = self.entries.get_mut(handle) {
            entry.subscriber = subscriber;
            entry.materializer = Some(materializer);
            entry.reader = reader;
            entry.stop = stop;
            entry.stopped = stopped;
            entry.task = task;
        }
        info!(shape = %handle, "shape restarted after crash");
        Ok(())
    }

    /// Stops a shape's consumer task and unsubscribes it from the
    /// Dispatcher. Does not delete its log; logs outlive consumers until
    /// explicit garbage collection.
    pub fn remove_shape(&self, handle: &ShapeHandle) -> Result<(), Error> {
        let (_, entry) = self
            .entries
            .remove(handle)
            .ok_or_else(|| Error::NotFound(handle.clone()))?;
        entry.stopped.store(true, Ordering::Release);
        entry.stop.notify_one();
        self.dispatcher.cancel(entry.subscriber);
        entry.task.abort();
        Ok(())
    }

    pub fn shape_count(&self) -> usize {
        self.entries.len()
    }
}

/// `column` the inner shape's materializer keys its row-set by. This core
/// takes it to be whichever column a dependent outer shape's `Subquery`
/// predicate names as `inner_key_column`; a shape with no dependents never
/// has that column consulted, so a shape with none declared falls back to
/// `"id"` as a harmless default.
fn primary_key_column(shape: &Shape) -> String {
    match &shape.predicate {
        crate::shape::Predicate::Subquery { inner_key_column, .. } => inner_key_column.clone(),
        _ => "id".to_string(),
    }
}

/// Kahn's algorithm over `shapes`' `shape_dependencies`, treating any handle
/// already satisfied by `is_registered` as a pre-existing root with no
/// further in-edges. Returns shapes in dependency order (leaves first);
/// errors if the batch contains a cycle or a dependency missing from both
/// `shapes` and the already-registered set.
fn topological_order(
    shapes: &[Shape],
    is_registered: impl Fn(&ShapeHandle) -> bool,
) -> Result<Vec<Shape>, Error> {
    let by_handle: HashMap<ShapeHandle, &Shape> =
        shapes.iter().map(|s| (s.handle().clone(), s)).collect();

    for shape in shapes {
        for dep in &shape.shape_dependencies {
            if !by_handle.contains_key(dep) && !is_registered(dep) {
                return Err(Error::UnknownDependency(shape.handle().clone(), dep.clone()));
            }
        }
    }

    let mut visited: HashSet<ShapeHandle> = HashSet::new();
    let mut in_progress: HashSet<ShapeHandle> = HashSet::new();
    let mut ordered = Vec::with_capacity(shapes.len());

    fn visit<'a>(
        handle: &ShapeHandle,
        by_handle: &HashMap<ShapeHandle, &'a Shape>,
        is_registered: &impl Fn(&ShapeHandle) -> bool,
        visited: &mut HashSet<ShapeHandle>,
        in_progress: &mut HashSet<ShapeHandle>,
        ordered: &mut Vec<Shape>,
    ) -> Result<(), Error> {
        if visited.contains(handle) || is_registered(handle) {
            return Ok(());
        }
        let Some(shape) = by_handle.get(handle) else {
            return Ok(()); // already validated present-or-registered above
        };
        if !in_progress.insert(handle.clone()) {
            return Err(Error::DependencyCycle(handle.clone()));
        }
        for dep in &shape.shape_dependencies {
            visit(dep, by_handle, is_registered, visited, in_progress, ordered)?;
        }
        in_progress.remove(handle);
        visited.insert(handle.clone());
        ordered.push((*shape).clone());
        Ok(())
    }

    for shape in shapes {
        visit(
            shape.handle(),
            &by_handle,
            &is_registered,
            &mut visited,
            &mut in_progress,
            &mut ordered,
        )?;
    }

    Ok(ordered)
}

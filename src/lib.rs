//! Shape dispatch and consumption core for a Postgres logical-replication
//! sync service: a single-producer, many-consumer fan-out
//! ([`dispatcher`]) from one [`producer::LogCollector`] to a dynamic set of
//! per-shape [`consumer::Consumer`]s, each durably logging its portion of
//! every transaction to [`storage`] and, for subquery shapes, coordinating
//! move-in/move-out detection through a [`materializer::Materializer`].
//!
//! [`state::State`] is the registry that ties the above together: it
//! resolves shape dependencies, starts inner shapes before outer ones, and
//! picks each shape's [`consumer::WriteUnit`].

pub mod change;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod install;
pub mod materializer;
pub mod partitions;
pub mod producer;
pub mod relation;
pub mod shape;
pub mod state;
pub mod storage;
pub mod subscriber;

pub use change::{Change, Offset, Transaction, Tuple, Value};
pub use consumer::{Consumer, ConsumerHandle, WriteUnit};
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use filter::Filter;
pub use install::Identity;
pub use materializer::{Delta, Materializer};
pub use partitions::Partitions;
pub use producer::LogCollector;
pub use relation::Relation;
pub use shape::{Predicate, Shape, ShapeHandle};
pub use state::State;
pub use storage::Storage;
pub use subscriber::SubscriberId;

/// Crate-wide result alias for callers that want the aggregated [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Instrumented global allocator backing the `stats_alloc`-measured bounded-
/// memory tests that assert `txn_fragment` mode never buffers a whole
/// multi-fragment transaction in memory; harmless overhead in
/// non-instrumented builds.
#[global_allocator]
static GLOBAL: &stats_alloc::StatsAlloc<std::alloc::System> = &stats_alloc::INSTRUMENTED_SYSTEM;

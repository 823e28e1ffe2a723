//! Crate-wide error aggregation.
//!
//! Individual modules define their own `Error` enum for their own
//! `Result` alias (`dispatcher::Error`, `materializer::Error`, ...); this
//! type composes them with `#[from]` for callers that just want "did this
//! fail", mirroring `backend::replication::logical::error::Error`.

use thiserror::Error;

use crate::consumer;
use crate::dispatcher;
use crate::materializer;
use crate::state;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Dispatcher(#[from] dispatcher::Error),

    #[error("{0}")]
    Consumer(#[from] consumer::Error),

    #[error("{0}")]
    Materializer(#[from] materializer::Error),

    #[error("{0}")]
    State(#[from] state::Error),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

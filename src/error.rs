//! Engine error types.
//!
//! A single coarse-grained `thiserror` enum, per-domain variants, `#[from]`
//! wiring for the ambient I/O/serialization boundaries. Most variants here
//! are recovered internally by the engine's failure-handling policy — they
//! exist as a typed vocabulary for the few paths that do surface to callers
//! (`ForkNotFound` via `recall_fork`, `SlotExhausted` logging, etc.), not
//! because every operation propagates them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("page not found: {0}")]
    PageNotFound(String),

    #[error("page I/O error for {id}: {message}")]
    PageIoError { id: String, message: String },

    #[error("page index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("summariser failure: {0}")]
    SummariserFailure(String),

    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("batch submit failure: {0}")]
    BatchSubmitFailure(String),

    #[error("slot exhausted: all loaded pages are pinned")]
    SlotExhausted,

    #[error("fork not found: {0}")]
    ForkNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

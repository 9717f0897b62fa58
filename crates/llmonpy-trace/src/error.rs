//! Errors surfaced by the trace store's own I/O, distinct from
//! [`llmonpy_core::StepError`] — a trace write failing never aborts the step
//! that produced the record it couldn't persist.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("trace store database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type TraceResult<T> = Result<T, TraceError>;

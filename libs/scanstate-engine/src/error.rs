use scanstate_api::{SourceError, StoreError};

use crate::worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Worker(#[from] WorkerError),
}

impl EngineError {
    pub fn config(context: &'static str, detail: impl Into<String>) -> Self {
        EngineError::Config { context, detail: detail.into() }
    }

    /// Prefix the detail with `ctx`; store and source errors keep their variant.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Config { context, detail } => EngineError::Config { context, detail: format!("{ctx}: {detail}") },
            EngineError::Store(e) => EngineError::Store(e.with_context(ctx)),
            EngineError::Source(e) => EngineError::Source(match e {
                SourceError::Unavailable(m) => SourceError::Unavailable(format!("{ctx}: {m}")),
                SourceError::Protocol(m) => SourceError::Protocol(format!("{ctx}: {m}")),
                SourceError::Config(m) => SourceError::Config(format!("{ctx}: {m}")),
                other => other,
            }),
            other => other,
        }
    }
}

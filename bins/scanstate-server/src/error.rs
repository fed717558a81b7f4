use scanstate_api::{SourceError, StoreError};
use scanstate_engine::{EngineError, WorkerError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("source: {0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Worker(#[from] WorkerError),

    #[error("no record for {0}")]
    NotFound(String),

    #[error("api: {0}")]
    Api(String),

    #[error("output: {0}")]
    Output(#[from] serde_json::Error),
}

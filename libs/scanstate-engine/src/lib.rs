//! Ingestion pipeline: decode envelopes, resolve them into the state store
//! and settle each delivery with its source.

pub mod config;
pub mod decode;
pub mod error;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::{ApiConfig, EngineConfig, SourceConfig, SourceKind, WorkerConfig};
pub use decode::{DataVersion, decode_envelope};
pub use error::EngineError;
pub use source::{ChannelPublisher, ChannelSource, TcpLineSource, open_source};
pub use store::{StoreConfig, open_store};
pub use supervisor::{Supervisor, SupervisorSettings};
pub use worker::{
    DecodeFailurePolicy, Disposition, Failure, IngestStats, IngestionWorker, Outcome, POISON_TARGET,
    StatsSnapshot, WorkerError, WorkerSettings, disposition,
};

/// Failure to turn a raw envelope into an [`Observation`](crate::Observation).
///
/// Decoding is pure, so the same bytes always produce the same error;
/// redelivering a message that failed here cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("unsupported data_version {0}")]
    UnsupportedVersion(i64),

    #[error("malformed v{version} data: {detail}")]
    Data { version: u8, detail: String },

    #[error("invalid base64 response: {0}")]
    Base64(String),
}

/// Storage backend failure. The worker treats every variant as transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or I/O failure.
    #[error("connection: {0}")]
    Connection(String),

    /// Value rejected by the backend.
    #[error("constraint: {0}")]
    Constraint(String),

    /// Statement or row-mapping failure.
    #[error("query: {0}")]
    Query(String),

    #[error("store is closed")]
    Closed,

    /// Invalid settings, reported while opening the store.
    #[error("config: {0}")]
    Config(String),
}

impl StoreError {
    /// Add context to the error, preserving the variant.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            StoreError::Connection(msg) => StoreError::Connection(format!("{ctx}: {msg}")),
            StoreError::Constraint(msg) => StoreError::Constraint(format!("{ctx}: {msg}")),
            StoreError::Query(msg) => StoreError::Query(format!("{ctx}: {msg}")),
            StoreError::Config(msg) => StoreError::Config(format!("{ctx}: {msg}")),
            StoreError::Closed => StoreError::Closed,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Message source failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Source cannot be reached at all (network, auth, missing subscription).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Ack or nack was not accepted; the message will be redelivered.
    #[error("settle {ack_id}: {detail}")]
    Settle { ack_id: String, detail: String },

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("config: {0}")]
    Config(String),
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Unavailable(e.to_string())
    }
}

use thiserror::Error;

pub type PixelResult<T> = Result<T, PixelError>;

#[derive(Error, Debug)]
pub enum PixelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Unknown pixel: {0}")]
    UnknownPixel(String),

    #[error("Inactive pixel: {0}")]
    InactivePixel(String),

    /// Unique-constraint collision on insert. Always recovered locally by
    /// re-selecting the winning row; must never reach the HTTP layer.
    #[error("Duplicate insert: {0}")]
    DuplicateInsert(String),

    /// The event row was written but its id could not be recovered. Fatal
    /// for the ingest request.
    #[error("Event id unavailable after insert for visitor {visitor_id}")]
    EventIdUnavailable { visitor_id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("KV store error: {0}")]
    Kv(String),

    /// A deferred-job write that did not read back after the put.
    #[error("KV write unverified for key {0}")]
    KvWriteUnverified(String),

    #[error("CRM request failed: {0}")]
    Crm(String),

    #[error("CRM request timed out after {0}ms")]
    CrmTimeout(u64),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PixelError {
    /// True for failures the CRM adapter may retry (network-level and 5xx).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PixelError::Crm(_) | PixelError::CrmTimeout(_))
    }
}

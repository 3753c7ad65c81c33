use thiserror::Error;

/// The crate's single error type. Every fallible operation in `disk_cache`
/// returns `Result<T>`; recoverable per-entry corruption and cache-wide
/// critical errors both flow through here, distinguished by variant.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry corruption, recovered locally: {0}")]
    Corruption(String),

    #[error("critical error, cache disabled: {0}")]
    CriticalError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("recovery error: {0}")]
    Recovery(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            CacheError::Io(e) => CacheError::Io(std::io::Error::new(e.kind(), e.to_string())),
            CacheError::Corruption(s) => CacheError::Corruption(s.clone()),
            CacheError::CriticalError(s) => CacheError::CriticalError(s.clone()),
            CacheError::NotFound(s) => CacheError::NotFound(s.clone()),
            CacheError::AlreadyExists(s) => CacheError::AlreadyExists(s.clone()),
            CacheError::InvalidInput(s) => CacheError::InvalidInput(s.clone()),
            CacheError::InvalidOperation(s) => CacheError::InvalidOperation(s.clone()),
            CacheError::Configuration(s) => CacheError::Configuration(s.clone()),
            CacheError::Recovery(s) => CacheError::Recovery(s.clone()),
            CacheError::LimitExceeded(s) => CacheError::LimitExceeded(s.clone()),
            CacheError::Unsupported(s) => CacheError::Unsupported(s.clone()),
            CacheError::Serialization(s) => CacheError::Serialization(s.clone()),
            CacheError::Internal(s) => CacheError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

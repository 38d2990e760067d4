use k2c_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConsulError>;

#[derive(Error, Debug)]
pub enum ConsulError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Consul returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Lock in use")]
    LockInUse,
}

impl From<ConsulError> for CoreError {
    fn from(e: ConsulError) -> Self {
        match e {
            ConsulError::Lock(_) | ConsulError::LockInUse => CoreError::LeaderLock(e.to_string()),
            other => CoreError::Catalog(other.to_string()),
        }
    }
}

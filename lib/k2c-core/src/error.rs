use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Leader lock error: {0}")]
    LeaderLock(String),

    #[error("Action queue closed")]
    QueueClosed,

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

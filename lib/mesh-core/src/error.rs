use mesh_api::UnknownStrategy;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Registry store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid load balance strategy: {0}")]
    InvalidStrategy(String),

    #[error("Circuit open for service: {0}")]
    CircuitOpen(String),

    #[error("Conflicting registration: {0}")]
    Conflict(String),

    #[error("Invalid mesh configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MeshError {
    /// Stable reason code reported alongside degraded results
    pub fn reason(&self) -> &'static str {
        match self {
            MeshError::NotFound(_) => "not_found",
            MeshError::StoreUnavailable(_) => "store_unavailable",
            MeshError::InvalidStrategy(_) => "invalid_strategy",
            MeshError::CircuitOpen(_) => "circuit_open",
            MeshError::Conflict(_) => "conflict",
            MeshError::InvalidConfiguration(_) => "invalid_configuration",
            MeshError::Serialization(_) => "serialization",
        }
    }
}

/// Failures raised by a registry store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0}ms")]
    Timeout(u64),
}

impl From<StoreError> for MeshError {
    fn from(err: StoreError) -> Self {
        MeshError::StoreUnavailable(err.to_string())
    }
}

impl From<UnknownStrategy> for MeshError {
    fn from(err: UnknownStrategy) -> Self {
        MeshError::InvalidStrategy(err.0)
    }
}

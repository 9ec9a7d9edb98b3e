use meshcast_transport::TransportError;

/// Protocol-level errors for meshcast.
///
/// Wraps transport errors and adds storage / serialization variants.
/// Address contention and channel failures are recovered internally and
/// only reach callers during bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("no claimable address after {attempts} attempts")]
    NoClaimableAddress { attempts: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("runtime shut down")]
    RuntimeShutDown,
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MeshError::Deserialization(e.to_string())
    }
}

impl From<rusqlite::Error> for MeshError {
    fn from(e: rusqlite::Error) -> Self {
        MeshError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Storage(format!("corrupt row: {e}"))
    }
}

impl From<tokio::task::JoinError> for MeshError {
    fn from(e: tokio::task::JoinError) -> Self {
        MeshError::Storage(format!("blocking task failed: {e}"))
    }
}

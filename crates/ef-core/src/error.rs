//! Error types for EchoForge

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum EfError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mesh format error: {0}")]
    MeshFormat(String),

    #[error("Unsupported mesh version: {0}")]
    UnsupportedMeshVersion(u8),

    #[error("Sample rate mismatch: {0} Hz vs {1} Hz")]
    SampleRateMismatch(f64, f64),
}

/// Result type alias
pub type EfResult<T> = Result<T, EfError>;

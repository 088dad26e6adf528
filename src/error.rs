use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("missing parameters for iteration {iteration}: {reason}")]
    MissingParameters { iteration: usize, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse recon params: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to write recon params: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("failed to (de)serialize parameters: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cfl error: {0}")]
    Cfl(String),
}

pub fn shape(msg: impl Into<String>) -> ReconError {
    ReconError::ShapeMismatch(msg.into())
}

pub fn config(msg: impl Into<String>) -> ReconError {
    ReconError::InvalidConfiguration(msg.into())
}

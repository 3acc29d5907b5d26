use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingertimeError {
    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("Malformed template blob: {len} bytes is not a multiple of {width}")]
    MalformedTemplate { len: usize, width: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FingertimeError>;

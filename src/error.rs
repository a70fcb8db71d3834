use burn::config::ConfigError;
use burn::record::RecorderError;

/// Errors raised while loading data, building networks or writing artifacts.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Preprocessing error: {0}")]
    Preprocess(String),

    #[error("Invalid architecture: {0}")]
    Architecture(String),

    #[error("Pretrained weights error: {0}")]
    Pretrained(String),

    #[error("Invalid artifact format: {0}")]
    Format(String),
}

pub type Result<T> = core::result::Result<T, Error>;

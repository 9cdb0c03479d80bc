//! Error types for the minimap locator library

use thiserror::Error;

/// Result type alias for the locator library
pub type Result<T> = std::result::Result<T, LocatorError>;

/// Errors that can occur during localization operations
#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("Model loading failed: {0}")]
    ModelLoadError(String),

    #[error("Inference failed: {0}")]
    InferenceError(String),

    #[error("Image preprocessing failed: {0}")]
    PreprocessingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("OpenCV error: {0}")]
    CvError(#[from] opencv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl LocatorError {
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoadError(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::InferenceError(msg.into())
    }

    pub fn preprocessing<S: Into<String>>(msg: S) -> Self {
        Self::PreprocessingError(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}

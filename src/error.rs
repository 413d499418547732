//! Error types for handtalk

use thiserror::Error;

/// Result type alias for handtalk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking or tracking hands
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote service answered with a non-success status
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Remote service answered without usable text
    #[error("empty response from {0}")]
    EmptyResponse(&'static str),

    /// Speech capture error
    #[error("capture error: {0}")]
    Capture(String),

    /// Speech playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Keypoint frame could not be read
    #[error("keypoint error: {0}")]
    Keypoints(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

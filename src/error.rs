//! Error types for the Ichigo voice client

use thiserror::Error;

/// Result type alias for Ichigo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or capture error
    #[error("audio error: {0}")]
    Audio(String),

    /// Audio resource could not be loaded or decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Microphone access denied or unavailable
    #[error("permission error: {0}")]
    Permission(String),

    /// Chat backend error
    #[error("chat error: {0}")]
    Chat(String),

    /// Pipeline task is gone
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

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

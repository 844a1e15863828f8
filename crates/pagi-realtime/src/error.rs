//! Error types for the PAGI Realtime session

use thiserror::Error;

/// Result type alias for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors that can occur while orchestrating a realtime voice session
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// Connect/disconnect misuse, or a device/network failure while connecting.
    /// The session is back in `Disconnected` and the caller may retry.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    SchemaValidation { tool: String, reason: String },

    #[error("Tool '{tool}' failed: {message}")]
    ToolHandler { tool: String, message: String },

    #[error("Operation not valid in current state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RealtimeError {
    /// Stable machine-readable kind, used in structured tool failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeError::Connection(_) => "connection",
            RealtimeError::DeviceUnavailable(_) => "device_unavailable",
            RealtimeError::DuplicateTool(_) => "duplicate_tool",
            RealtimeError::UnknownTool(_) => "unknown_tool",
            RealtimeError::SchemaValidation { .. } => "schema_validation",
            RealtimeError::ToolHandler { .. } => "tool_handler",
            RealtimeError::InvalidState(_) => "invalid_state",
            RealtimeError::Protocol(_) => "protocol",
            RealtimeError::AudioStream(_) => "audio_stream",
            RealtimeError::ChannelSend(_) => "channel_send",
            RealtimeError::Config(_) => "config",
            RealtimeError::Json(_) => "json",
            RealtimeError::Io(_) => "io",
        }
    }
}

impl From<config::ConfigError> for RealtimeError {
    fn from(err: config::ConfigError) -> Self {
        RealtimeError::Config(err.to_string())
    }
}

#[cfg(feature = "cpal-backend")]
impl From<cpal::DevicesError> for RealtimeError {
    fn from(err: cpal::DevicesError) -> Self {
        RealtimeError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "cpal-backend")]
impl From<cpal::DefaultStreamConfigError> for RealtimeError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        RealtimeError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "cpal-backend")]
impl From<cpal::BuildStreamError> for RealtimeError {
    fn from(err: cpal::BuildStreamError) -> Self {
        RealtimeError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "cpal-backend")]
impl From<cpal::PlayStreamError> for RealtimeError {
    fn from(err: cpal::PlayStreamError) -> Self {
        RealtimeError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "cpal-backend")]
impl From<cpal::PauseStreamError> for RealtimeError {
    fn from(err: cpal::PauseStreamError) -> Self {
        RealtimeError::AudioStream(err.to_string())
    }
}

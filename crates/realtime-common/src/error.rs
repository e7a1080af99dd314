//! Error types for realtime subscriptions

use thiserror::Error;

/// Realtime subscription error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration Errors
    #[error("Invalid subscription config: {0}")]
    InvalidConfig(String),

    #[error("Invalid row filter: {0}")]
    InvalidFilter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Transport Errors
    #[error("Failed to open channel {channel}: {reason}")]
    ChannelOpen { channel: String, reason: String },

    #[error("Channel error on {channel}: {reason}")]
    ChannelError { channel: String, reason: String },

    #[error("Channel closed by transport: {0}")]
    ChannelClosed(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // Handler Errors
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    // General Errors
    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for realtime operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transport failures; anything else reaching the retry path is reported as `ChannelOpen`
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpen { .. } | Self::ChannelError { .. } | Self::ChannelClosed(_)
        )
    }

    /// Stable error code for logs and status surfaces
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::Config(_) => "config_error",
            Self::ChannelOpen { .. } => "channel_open_failed",
            Self::ChannelError { .. } => "channel_error",
            Self::ChannelClosed(_) => "channel_closed",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Handler(_) => "handler_error",
            Self::HandlerPanicked(_) => "handler_panicked",
            Self::NoRuntime(_) => "no_runtime",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

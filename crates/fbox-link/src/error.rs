//! # Link Error Types
//!
//! Error types for the broker connection, wire protocol and event dispatch.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Link Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  NotConnected   │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  SendFailed     │  │  InvalidTopic           │ │
//! │  │  ConfigLoad/Save│  │  Connection     │  │  (De)Serialization      │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │    Internal     │                              │
//! │  │  handler writes │  │  ShuttingDown   │                              │
//! │  │                 │  │  ChannelError   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Link error type covering broker, protocol and dispatch failures.
#[derive(Debug, Error)]
pub enum LinkError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid broker URL.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The broker connection is not up; nothing was sent.
    #[error("Not connected to broker")]
    NotConnected,

    /// The client refused or failed to queue a publish.
    #[error("Publish failed: {0}")]
    SendFailed(String),

    /// Failed to establish or keep the broker connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker closed the connection.
    #[error("Disconnected from broker")]
    Disconnected,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Payload is not a recognisable status message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Topic does not follow `fbox/{device}/status`.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Failed to serialize a command.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// A handler's ledger write failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The link is shutting down.
    #[error("Device link is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fbox_db::DbError> for LinkError {
    fn from(err: fbox_db::DbError) -> Self {
        LinkError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for LinkError {
    fn from(err: url::ParseError) -> Self {
        LinkError::InvalidUrl(err.to_string())
    }
}

impl From<rumqttc::ClientError> for LinkError {
    fn from(err: rumqttc::ClientError) -> Self {
        LinkError::SendFailed(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for LinkError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        LinkError::ConnectionFailed(err.to_string())
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for LinkError {
    fn from(err: toml::de::Error) -> Self {
        LinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for LinkError {
    fn from(err: toml::ser::Error) -> Self {
        LinkError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl LinkError {
    /// Returns true if the operation may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::NotConnected
                | LinkError::SendFailed(_)
                | LinkError::ConnectionFailed(_)
                | LinkError::Disconnected
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidConfig(_)
                | LinkError::InvalidUrl(_)
                | LinkError::ConfigLoadFailed(_)
                | LinkError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if a device sent something we could not understand.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidMessage(_) | LinkError::InvalidTopic(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LinkError::NotConnected.is_retryable());
        assert!(LinkError::ConnectionFailed("refused".into()).is_retryable());
        assert!(LinkError::Disconnected.is_retryable());

        assert!(!LinkError::InvalidConfig("bad".into()).is_retryable());
        assert!(!LinkError::InvalidTopic("x".into()).is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(LinkError::InvalidUrl("ftp://x".into()).is_config_error());
        assert!(LinkError::InvalidMessage("{".into()).is_protocol_error());
        assert!(!LinkError::ShuttingDown.is_config_error());
    }
}

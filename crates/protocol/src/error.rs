//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering malformed or unusable viewer messages.
///
/// Viewers never see these directly: the daemon degrades a malformed
/// structured message to raw input and only logs the error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A resize request carried a zero dimension.
    #[error("invalid window size: {rows}x{cols}")]
    InvalidWindowSize {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },

    /// A structured message had an unknown `type` tag.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_invalid_window_size_display() {
        let err = ProtocolError::InvalidWindowSize { rows: 0, cols: 80 };
        assert_eq!(err.to_string(), "invalid window size: 0x80");
    }

    #[test]
    fn test_unknown_message_type_display() {
        let err = ProtocolError::UnknownMessageType("ping".to_string());
        assert_eq!(err.to_string(), "unknown message type: ping");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}

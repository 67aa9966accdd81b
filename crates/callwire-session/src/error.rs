//! Error types for the session layer.

use crate::TransportState;

/// Errors returned by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The transport was closed; it never sends again.
    #[error("transport closed")]
    Closed,

    /// The transport is still connecting or reconnecting.
    #[error("transport not open (state: {0})")]
    NotOpen(TransportState),

    /// The envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] callwire_protocol::ProtocolError),

    /// The channel refused the payload.
    #[error(transparent)]
    Transport(#[from] callwire_transport::TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(SessionError::Closed.to_string(), "transport closed");
        assert_eq!(
            SessionError::NotOpen(TransportState::Reconnecting).to_string(),
            "transport not open (state: reconnecting)"
        );
    }

    #[test]
    fn test_from_transport_error() {
        let err: SessionError =
            callwire_transport::TransportError::ChannelClosed("gone".into()).into();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(err.to_string(), "channel closed: gone");
    }
}

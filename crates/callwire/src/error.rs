//! Unified error type for callwire.

use callwire_protocol::ProtocolError;
use callwire_session::SessionError;
use callwire_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `callwire` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum CallwireError {
    /// A channel-level error (bind, accept, send).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport lifecycle error (closed, not open).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An inbound channel could not be admitted.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

/// Why an inbound channel was not handed to the application.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Nothing is subscribed to connection requests, so no one can decide.
    #[error("no connection request handler registered")]
    NoHandler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ChannelClosed("gone".into());
        let callwire_err: CallwireError = err.into();
        assert!(matches!(callwire_err, CallwireError::Transport(_)));
        assert!(callwire_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let callwire_err: CallwireError = err.into();
        assert!(matches!(callwire_err, CallwireError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let callwire_err: CallwireError = SessionError::Closed.into();
        assert!(matches!(callwire_err, CallwireError::Session(_)));
        assert_eq!(callwire_err.to_string(), "transport closed");
    }

    #[test]
    fn test_from_admission_error() {
        let callwire_err: CallwireError = AdmissionError::NoHandler.into();
        assert!(matches!(callwire_err, CallwireError::Admission(_)));
    }
}

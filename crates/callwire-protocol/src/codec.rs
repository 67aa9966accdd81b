//! Codec trait and the envelope framing built on it.
//!
//! A "codec" converts between Rust types and raw bytes. Transports don't
//! care how envelopes are serialized; they hold something implementing
//! [`Codec`] and go through [`Envelope::encode`] / [`Envelope::decode`].
//! [`JsonCodec`] is the one the wire format in this crate is defined for.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Envelope, ProtocolError};

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Clone` because every transport keeps its own copy.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ```rust
/// use callwire_protocol::{Envelope, JsonCodec};
///
/// let env = Envelope::notification("ping", serde_json::Value::Null);
/// let bytes = env.encode(&JsonCodec).unwrap();
/// assert_eq!(bytes, br#"{"kind":"Notification","name":"ping"}"#);
/// assert_eq!(Envelope::decode(&JsonCodec, &bytes).unwrap(), env);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Envelope framing
// ---------------------------------------------------------------------------

impl Envelope {
    /// Serializes the envelope with the given codec.
    pub fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, ProtocolError> {
        codec.encode(self)
    }

    /// Decodes and validates a raw inbound payload.
    ///
    /// # Errors
    /// - [`ProtocolError::Empty`] for empty or whitespace-only input
    /// - [`ProtocolError::Decode`] for anything that isn't an envelope
    /// - [`ProtocolError::InvalidMessage`] when [`Envelope::validate`] fails
    pub fn decode<C: Codec>(codec: &C, raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(ProtocolError::Empty);
        }
        let envelope: Envelope = codec.decode(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Parses a JSON payload, returning `None` for anything empty or malformed.
pub fn parse(raw: &[u8]) -> Option<Envelope> {
    Envelope::decode(&JsonCodec, raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_parse_request() {
        let raw = br#"{"kind":"Request","id":12,"method":"join","data":{"room":"r1"}}"#;
        match parse(raw) {
            Some(Envelope::Request(req)) => {
                assert_eq!(req.id, 12);
                assert_eq!(req.method, "join");
                assert_eq!(req.data, json!({"room": "r1"}));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_failed_response() {
        let raw = br#"{"kind":"Response","id":12,"ok":false,"errorCode":500,"errorReason":"boom"}"#;
        match parse(raw) {
            Some(Envelope::Response(res)) => {
                assert!(!res.ok);
                assert_eq!(res.error_code, Some(500));
                assert_eq!(res.error_reason.as_deref(), Some("boom"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification_without_data() {
        let env = parse(br#"{"kind":"Notification","name":"ping"}"#).unwrap();
        assert_eq!(env, Envelope::notification("ping", Value::Null));
    }

    #[test]
    fn test_empty_and_whitespace_are_empty_errors() {
        assert!(matches!(
            Envelope::decode(&JsonCodec, b""),
            Err(ProtocolError::Empty)
        ));
        assert!(matches!(
            Envelope::decode(&JsonCodec, b"  \n"),
            Err(ProtocolError::Empty)
        ));
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        let cases: &[&[u8]] = &[
            b"not json",
            b"{}",
            br#"{"kind":"Unknown","id":1}"#,
            br#"{"kind":"Request","method":"x"}"#,
            br#"{"kind":"Response","id":"one","ok":true}"#,
            br#"[1,2,3]"#,
        ];
        for raw in cases {
            assert!(
                matches!(
                    Envelope::decode(&JsonCodec, raw),
                    Err(ProtocolError::Decode(_))
                ),
                "{} should not decode",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_invalid_envelopes_are_rejected_after_decoding() {
        assert!(matches!(
            Envelope::decode(&JsonCodec, br#"{"kind":"Response","id":3,"ok":false}"#),
            Err(ProtocolError::InvalidMessage(_))
        ));
        assert_eq!(parse(br#"{"kind":"Request","id":3,"method":""}"#), None);
    }

    #[test]
    fn test_encoded_request_decodes_to_same_envelope() {
        let env = Envelope::request("produce", json!({"kind": "audio"}));
        let bytes = env.encode(&JsonCodec).unwrap();
        assert_eq!(Envelope::decode(&JsonCodec, &bytes).unwrap(), env);
    }
}

//! Envelope types: the shape of every message on the wire.
//!
//! There are three kinds of message, told apart by the `kind` field:
//!
//! ```text
//! {"kind":"Request","id":4711,"method":"join","data":{"room":"r1"}}
//! {"kind":"Response","id":4711,"ok":true,"data":{"peers":[]}}
//! {"kind":"Response","id":4711,"ok":false,"errorCode":404,"errorReason":"no such room"}
//! {"kind":"Notification","name":"ping"}
//! ```
//!
//! A request expects exactly one response carrying the same `id`. A
//! notification is fire-and-forget. `data` is optional everywhere and left
//! out of the JSON when it is `null`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Upper bound (exclusive) for generated request ids.
const MAX_REQUEST_ID: u32 = 10_000_000;

/// A parsed wire message.
///
/// `#[serde(tag = "kind")]` puts the variant name in a `kind` field next to
/// the variant's own fields instead of nesting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    /// A call that expects a [`Response`].
    Request(Request),
    /// The answer to a [`Request`].
    Response(Response),
    /// A one-way message.
    Notification(Notification),
}

impl Envelope {
    /// Builds a request with a fresh random id.
    pub fn request(method: impl Into<String>, data: Value) -> Self {
        Self::Request(Request::new(method, data))
    }

    /// Builds a notification.
    pub fn notification(name: impl Into<String>, data: Value) -> Self {
        Self::Notification(Notification::new(name, data))
    }

    /// The correlation id, for requests and responses.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Request(r) => Some(r.id),
            Self::Response(r) => Some(r.id),
            Self::Notification(_) => None,
        }
    }

    /// Checks the rules serde can't express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Request(r) if r.method.is_empty() => Err(
                ProtocolError::InvalidMessage("request without method".into()),
            ),
            Self::Response(r) if !r.ok && r.error_code.is_none() => {
                Err(ProtocolError::InvalidMessage(format!(
                    "failed response {} without error code",
                    r.id
                )))
            }
            Self::Notification(n) if n.name.is_empty() => Err(
                ProtocolError::InvalidMessage("notification without name".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A call expecting a response with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed by the response.
    pub id: u32,
    /// What is being asked for.
    pub method: String,
    /// Method arguments.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Request {
    /// Creates a request with a random id in `1..10_000_000`.
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            id: rand::rng().random_range(1..MAX_REQUEST_ID),
            method: method.into(),
            data,
        }
    }

    /// Builds the successful response to this request.
    pub fn success(&self, data: Value) -> Response {
        Response {
            id: self.id,
            ok: true,
            data,
            error_code: None,
            error_reason: None,
        }
    }

    /// Builds the failed response to this request.
    pub fn error(&self, code: u16, reason: impl Into<String>) -> Response {
        Response {
            id: self.id,
            ok: false,
            data: Value::Null,
            error_code: Some(code),
            error_reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the request being answered.
    pub id: u32,
    /// Whether the request succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Error code when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    /// Error description when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl Response {
    /// Converts into `Ok(data)` or `Err((code, reason))`.
    pub fn into_result(self) -> Result<Value, (u16, String)> {
        if self.ok {
            Ok(self.data)
        } else {
            Err((
                self.error_code.unwrap_or(500),
                self.error_reason.unwrap_or_default(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// A one-way message; no response is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event name.
    pub name: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Notification {
    /// Creates a notification.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_wire_shape() {
        let env = Envelope::notification("ping", Value::Null);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"kind": "Notification", "name": "ping"}));
    }

    #[test]
    fn test_error_response_wire_shape_uses_camel_case() {
        let req = Request {
            id: 7,
            method: "join".into(),
            data: Value::Null,
        };
        let env: Envelope = req.error(404, "no such room").into();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "Response",
                "id": 7,
                "ok": false,
                "errorCode": 404,
                "errorReason": "no such room"
            })
        );
    }

    #[test]
    fn test_request_ids_are_in_range() {
        for _ in 0..100 {
            let req = Request::new("m", Value::Null);
            assert!(req.id >= 1 && req.id < MAX_REQUEST_ID);
        }
    }

    #[test]
    fn test_success_response_echoes_id() {
        let req = Request::new("getRouterRtpCapabilities", json!({}));
        let res = req.success(json!({"codecs": []}));
        assert_eq!(res.id, req.id);
        assert!(res.ok);
        assert_eq!(res.into_result(), Ok(json!({"codecs": []})));
    }

    #[test]
    fn test_failed_response_into_result() {
        let req = Request::new("join", Value::Null);
        assert_eq!(
            req.error(403, "nope").into_result(),
            Err((403, "nope".to_string()))
        );
    }

    #[test]
    fn test_envelope_id() {
        let req = Request::new("a", Value::Null);
        let id = req.id;
        assert_eq!(Envelope::from(req).id(), Some(id));
        assert_eq!(Envelope::notification("n", Value::Null).id(), None);
    }

    #[test]
    fn test_validate_rejects_empty_method_and_missing_error_code() {
        let empty = Envelope::Request(Request {
            id: 1,
            method: String::new(),
            data: Value::Null,
        });
        assert!(matches!(
            empty.validate(),
            Err(ProtocolError::InvalidMessage(_))
        ));

        let bad_failure = Envelope::Response(Response {
            id: 1,
            ok: false,
            data: Value::Null,
            error_code: None,
            error_reason: Some("x".into()),
        });
        assert!(bad_failure.validate().is_err());

        let nameless = Envelope::notification("", Value::Null);
        assert!(nameless.validate().is_err());

        assert!(Envelope::notification("ok", Value::Null).validate().is_ok());
    }
}

//! Inbound payload handling shared by both transport kinds.

use callwire_protocol::{Codec, Envelope, ProtocolError};
use tracing::{debug, error, warn};

use crate::{BusEvent, EventBus};

/// Decodes `raw` and publishes it as a message event.
///
/// Empty and malformed payloads are logged and dropped, as are messages
/// nobody is listening for. Returns whether the message was published.
pub(crate) fn deliver<E, C>(
    bus: &EventBus<E>,
    codec: &C,
    raw: &[u8],
    kind: E::Kind,
    wrap: impl FnOnce(Envelope) -> E,
) -> bool
where
    E: BusEvent,
    C: Codec,
{
    let envelope = match Envelope::decode(codec, raw) {
        Ok(envelope) => envelope,
        Err(ProtocolError::Empty) => {
            debug!("ignoring empty message");
            return false;
        }
        Err(e) => {
            warn!(error = %e, len = raw.len(), "ignoring malformed message");
            return false;
        }
    };

    if bus.listener_count(kind) == 0 {
        error!("no listeners for \"message\" event, ignoring received message");
        return false;
    }

    bus.publish(&wrap(envelope));
    true
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use callwire_protocol::JsonCodec;

    use super::*;

    #[derive(Debug)]
    struct Received(Envelope);

    impl BusEvent for Received {
        type Kind = ();
        fn kind(&self) {}
    }

    #[test]
    fn test_valid_message_is_published() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe((), move |e: &Received| sink.lock().unwrap().push(e.0.clone()));

        let raw = br#"{"kind":"Notification","name":"ping"}"#;
        assert!(deliver(&bus, &JsonCodec, raw, (), Received));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Envelope::notification("ping", serde_json::Value::Null)]
        );
    }

    #[test]
    fn test_bad_payloads_are_dropped() {
        let bus = EventBus::new();
        bus.subscribe((), |_: &Received| panic!("must not be called"));
        assert!(!deliver(&bus, &JsonCodec, b"", (), Received));
        assert!(!deliver(&bus, &JsonCodec, b"{not json", (), Received));
        assert!(!deliver(&bus, &JsonCodec, br#"{"kind":"Nope"}"#, (), Received));
    }

    #[test]
    fn test_message_without_listener_is_dropped() {
        let bus: EventBus<Received> = EventBus::new();
        let raw = br#"{"kind":"Notification","name":"ping"}"#;
        assert!(!deliver(&bus, &JsonCodec, raw, (), Received));
    }
}

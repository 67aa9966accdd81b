//! Integration tests for the server transport over in-memory channels.

use std::net::SocketAddr;
use std::time::Duration;

use callwire_protocol::{Envelope, JsonCodec};
use callwire_session::{
    SERVER_CLOSE_CODE, ServerEvent, ServerEventKind, ServerTransport, SessionError,
    TransportState,
};
use callwire_transport::RequestInfo;
use callwire_transport::memory::{self, MemoryFrame, MemoryRemote};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::Span;

// =========================================================================
// Helpers
// =========================================================================

fn transport() -> (ServerTransport, MemoryRemote) {
    let (channel, events, remote) = memory::channel();
    remote.connect();
    let info = RequestInfo::new(SocketAddr::from(([127, 0, 0, 1], 40000)))
        .with_query("peerId", "alice");
    let transport = ServerTransport::new(Box::new(channel), events, info, JsonCodec, Span::none());
    (transport, remote)
}

/// Forwards a short description of every event into a channel.
fn record(transport: &ServerTransport) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        ServerEventKind::Message,
        ServerEventKind::Error,
        ServerEventKind::Close,
    ] {
        let tx = tx.clone();
        transport.subscribe(kind, move |event: &ServerEvent| {
            let line = match event {
                ServerEvent::Message(Envelope::Request(req)) => format!("request {}", req.method),
                ServerEvent::Message(Envelope::Notification(n)) => format!("notification {}", n.name),
                ServerEvent::Message(Envelope::Response(res)) => format!("response {}", res.id),
                ServerEvent::Error(e) => format!("error {e}"),
                ServerEvent::Close => "close".to_string(),
            };
            let _ = tx.send(line);
        });
    }
    rx
}

async fn next(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_starts_open_with_handshake_info() {
    let (transport, remote) = transport();
    assert_eq!(transport.state(), TransportState::Open);
    assert_eq!(transport.id(), remote.id());
    assert_eq!(transport.info().query_param("peerId"), Some("alice"));
}

#[tokio::test]
async fn test_request_and_response_flow() {
    let (transport, mut remote) = transport();
    let mut events = record(&transport);
    transport.start();

    remote.deliver(r#"{"kind":"Request","id":5,"method":"join","data":{"room":"r1"}}"#);
    assert_eq!(next(&mut events).await, "request join");

    let answer: Envelope = callwire_protocol::Request {
        id: 5,
        method: "join".into(),
        data: json!({"room": "r1"}),
    }
    .success(json!({"peers": []}))
    .into();
    transport.send(&answer).unwrap();

    let Some(MemoryFrame::Data(bytes)) = remote.next_frame().await else {
        panic!("expected a data frame");
    };
    let sent: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        sent,
        json!({"kind": "Response", "id": 5, "ok": true, "data": {"peers": []}})
    );
}

#[tokio::test]
async fn test_nothing_is_read_before_start() {
    let (transport, remote) = transport();
    let mut events = record(&transport);
    remote.deliver(r#"{"kind":"Notification","name":"queued"}"#);
    tokio::task::yield_now().await;
    assert!(events.try_recv().is_err());

    transport.start();
    transport.start();
    assert_eq!(next(&mut events).await, "notification queued");
}

#[tokio::test]
async fn test_bad_payloads_are_dropped() {
    let (transport, remote) = transport();
    let mut events = record(&transport);
    transport.start();

    remote.deliver("");
    remote.deliver("[]");
    remote.deliver(r#"{"kind":"Response","id":1,"ok":false}"#);
    remote.deliver(r#"{"kind":"Notification","name":"fine"}"#);
    assert_eq!(next(&mut events).await, "notification fine");
}

#[tokio::test]
async fn test_channel_error_is_reported_then_closes() {
    let (transport, mut remote) = transport();
    let mut events = record(&transport);
    transport.start();

    remote.error("bad frame");
    assert_eq!(next(&mut events).await, "error receive failed: bad frame");
    assert_eq!(next(&mut events).await, "close");
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(
        remote.next_frame().await,
        Some(MemoryFrame::Close {
            code: SERVER_CLOSE_CODE,
            reason: "channel error".to_string()
        })
    );

    // A later disconnect or close publishes nothing more.
    remote.disconnect("gone");
    transport.close();
    tokio::task::yield_now().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_closes_the_transport() {
    let (transport, remote) = transport();
    let mut events = record(&transport);
    transport.start();

    remote.disconnect("peer went away");
    assert_eq!(next(&mut events).await, "close");
    assert!(transport.is_closed());
    assert!(matches!(
        transport.send(&Envelope::notification("x", json!(null))),
        Err(SessionError::Closed)
    ));

    // Closing an already closed transport publishes nothing.
    transport.close();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_remote_closes_the_transport() {
    let (transport, remote) = transport();
    let mut events = record(&transport);
    transport.start();
    drop(remote);
    assert_eq!(next(&mut events).await, "close");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (transport, mut remote) = transport();
    let mut events = record(&transport);
    transport.start();

    transport.close();
    transport.close();
    assert_eq!(next(&mut events).await, "close");
    assert_eq!(
        remote.try_next_frame(),
        Some(MemoryFrame::Close {
            code: SERVER_CLOSE_CODE,
            reason: "closed by server".into()
        })
    );
    assert_eq!(remote.try_next_frame(), None);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_drop_closes_the_channel() {
    let (transport, mut remote) = transport();
    drop(transport);
    assert_eq!(
        remote.next_frame().await,
        Some(MemoryFrame::Close {
            code: 4000,
            reason: "closed by server".into()
        })
    );
}

//! Channel abstraction layer for callwire.
//!
//! A [`Channel`] is the raw duplex conduit a logical transport is built on.
//! It is event driven: whoever opens one gets back a handle for outbound
//! traffic and a [`ChannelEvents`] receiver that yields [`ChannelEvent`]s
//! (connected, message, error, disconnected) in the order the socket
//! produced them.
//!
//! - Clients open channels through a [`Connector`]; every call opens a brand
//!   new channel, so reconnecting never reuses an old one.
//! - Servers receive channels from a [`Listener`] as [`Inbound`] values that
//!   also carry the handshake metadata ([`RequestInfo`]).
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket channels via `tokio-tungstenite`
//! - `memory`: in-process channels driven by hand, for tests

mod error;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{
    DEFAULT_HANDSHAKE_TIMEOUT, WebSocketChannel, WebSocketConnector, WebSocketListener,
};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
#[cfg(any(feature = "websocket", feature = "memory"))]
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Counter for generating unique channel IDs.
#[cfg(any(feature = "websocket", feature = "memory"))]
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next process-wide channel id.
#[cfg(any(feature = "websocket", feature = "memory"))]
pub(crate) fn next_channel_id() -> ChannelId {
    ChannelId::new(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Opaque identifier for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a new `ChannelId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Something that happened on a channel.
///
/// A channel emits at most one `Connected`, any number of `Message` and
/// `Error` events, and finishes with exactly one `Disconnected`. After that
/// the event stream ends.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The underlying connection is established.
    Connected,
    /// A raw inbound payload.
    Message(Vec<u8>),
    /// A non-terminal error report. A terminal failure is always followed
    /// by `Disconnected`.
    Error(TransportError),
    /// The connection is gone (or never came up).
    Disconnected {
        /// Human-readable cause, for logging.
        reason: String,
    },
}

/// Receiving half of a channel's event stream.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Outbound half of a duplex channel.
///
/// Both methods only enqueue work for the channel's own I/O task, so they
/// never block and are safe to call while holding a short-lived lock.
pub trait Channel: Send + Sync + 'static {
    /// Returns the unique identifier for this channel.
    fn id(&self) -> ChannelId;

    /// Queues a payload for delivery to the remote peer.
    ///
    /// Fails immediately if the channel is already gone.
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Requests teardown with an application close code and reason.
    fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens outbound channels (client side).
pub trait Connector: Send + Sync + 'static {
    /// Starts opening a new channel.
    ///
    /// Returns immediately; the outcome is reported through the returned
    /// events (`Connected`, or `Error`/`Disconnected` on failure).
    fn open(&self) -> (Box<dyn Channel>, ChannelEvents);
}

/// Handshake metadata of an inbound channel.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Decoded URL query parameters.
    pub query: HashMap<String, String>,
    /// Request path, without the query string.
    pub path: String,
    /// `Origin` header, when the client sent one.
    pub origin: Option<String>,
    /// Address of the remote peer.
    pub remote_addr: SocketAddr,
}

impl RequestInfo {
    /// Creates metadata with an empty query and path `/`.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            query: HashMap::new(),
            path: "/".to_string(),
            origin: None,
            remote_addr,
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    /// Looks up a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// A freshly accepted channel that has not been admitted yet.
pub struct Inbound {
    /// Outbound half.
    pub channel: Box<dyn Channel>,
    /// Event stream of the channel.
    pub events: ChannelEvents,
    /// Handshake metadata.
    pub info: RequestInfo,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("channel", &self.channel.id())
            .field("info", &self.info)
            .finish()
    }
}

/// Accepts inbound channels (server side).
pub trait Listener: Send + 'static {
    /// Waits for and accepts the next inbound channel.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Inbound, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_new_and_into_inner() {
        let id = ChannelId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new(7);
        assert_eq!(id.to_string(), "chan-7");
    }

    #[test]
    fn test_channel_id_hash_works_as_map_key() {
        let mut map = HashMap::new();
        map.insert(ChannelId::new(1), "alice");
        map.insert(ChannelId::new(2), "bob");
        assert_eq!(map[&ChannelId::new(1)], "alice");
    }

    #[test]
    fn test_request_info_query_lookup() {
        let info = RequestInfo::new("127.0.0.1:9000".parse().unwrap())
            .with_query("roomId", "r1")
            .with_query("peerId", "alice");
        assert_eq!(info.query_param("roomId"), Some("r1"));
        assert_eq!(info.query_param("peerId"), Some("alice"));
        assert_eq!(info.query_param("missing"), None);
        assert_eq!(info.path, "/");
    }
}

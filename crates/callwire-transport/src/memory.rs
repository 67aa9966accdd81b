//! In-process channels driven by hand.
//!
//! Every [`MemoryChannel`] comes with a [`MemoryRemote`]: the remote end of
//! the conduit. Tests use the remote to script what the "network" does
//! (connect, deliver payloads, fail, drop) and to inspect what the local side
//! sent, without sockets or timing.
//!
//! ```rust
//! use callwire_transport::memory::{self, MemoryFrame};
//! use callwire_transport::{Channel, ChannelEvent};
//!
//! let (channel, mut events, mut remote) = memory::channel();
//! remote.connect();
//! assert!(matches!(events.try_recv(), Ok(ChannelEvent::Connected)));
//!
//! channel.send(b"hi".to_vec()).unwrap();
//! assert_eq!(remote.try_next_frame(), Some(MemoryFrame::Data(b"hi".to_vec())));
//! ```

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::{
    Channel, ChannelEvent, ChannelEvents, ChannelId, Connector, Inbound,
    Listener, RequestInfo, TransportError, next_channel_id,
};

/// What the local side of a memory channel put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryFrame {
    /// An outbound payload.
    Data(Vec<u8>),
    /// A teardown request.
    Close {
        /// Application close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Local handle of an in-memory channel.
#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    frames: mpsc::UnboundedSender<MemoryFrame>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.frames.send(MemoryFrame::Data(data)).map_err(|_| {
            TransportError::ChannelClosed(format!("{} remote dropped", self.id))
        })
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.frames
            .send(MemoryFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| {
                TransportError::ChannelClosed(format!(
                    "{} remote dropped",
                    self.id
                ))
            })
    }
}

/// Remote end of an in-memory channel.
///
/// Dropping the remote ends the event stream, which the local side sees as
/// a disconnect.
#[derive(Debug)]
pub struct MemoryRemote {
    id: ChannelId,
    events: mpsc::UnboundedSender<ChannelEvent>,
    frames: mpsc::UnboundedReceiver<MemoryFrame>,
}

impl MemoryRemote {
    /// Id of the channel this remote belongs to.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Reports the connection as established.
    pub fn connect(&self) {
        self.emit(ChannelEvent::Connected);
    }

    /// Delivers a raw payload to the local side.
    pub fn deliver(&self, data: impl Into<Vec<u8>>) {
        self.emit(ChannelEvent::Message(data.into()));
    }

    /// Reports a non-terminal error.
    pub fn error(&self, message: &str) {
        self.emit(ChannelEvent::Error(TransportError::ReceiveFailed(
            message.to_string(),
        )));
    }

    /// Reports the connection as gone.
    pub fn disconnect(&self, reason: &str) {
        self.emit(ChannelEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Waits for the next frame the local side sent.
    ///
    /// Returns `None` once the local handle is dropped and all frames are
    /// drained.
    pub async fn next_frame(&mut self) -> Option<MemoryFrame> {
        self.frames.recv().await
    }

    /// Returns the next already-sent frame without waiting.
    pub fn try_next_frame(&mut self) -> Option<MemoryFrame> {
        self.frames.try_recv().ok()
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(id = %self.id, "local side no longer listening");
        }
    }
}

/// Creates a channel together with its event stream and remote end.
pub fn channel() -> (MemoryChannel, ChannelEvents, MemoryRemote) {
    let id = next_channel_id();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            id,
            frames: frames_tx,
        },
        events_rx,
        MemoryRemote {
            id,
            events: events_tx,
            frames: frames_rx,
        },
    )
}

// ---------------------------------------------------------------------------
// Connector / Listener
// ---------------------------------------------------------------------------

/// A [`Connector`] that hands the remote end of every opened channel to the
/// test through an mpsc receiver.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<MemoryRemote>,
}

impl MemoryConnector {
    /// Creates a connector and the receiver that yields one
    /// [`MemoryRemote`] per `open()` call, in order.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { remotes: tx }, rx)
    }
}

impl Connector for MemoryConnector {
    fn open(&self) -> (Box<dyn Channel>, ChannelEvents) {
        let (channel, events, remote) = channel();
        // If the test dropped the receiver the remote is dropped too, which
        // the opener observes as an immediate disconnect.
        let _ = self.remotes.send(remote);
        (Box::new(channel), events)
    }
}

/// A [`Listener`] fed by [`MemoryDialer`].
#[derive(Debug)]
pub struct MemoryListener {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Creates inbound channels for a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MemoryDialer {
    /// Dials the listener with the given handshake metadata.
    ///
    /// The channel is reported as connected straight away. Returns the
    /// remote end, or `None` if the listener is gone.
    pub fn dial(&self, info: RequestInfo) -> Option<MemoryRemote> {
        let (channel, events, remote) = channel();
        remote.connect();
        self.inbound
            .send(Inbound {
                channel: Box::new(channel),
                events,
                info,
            })
            .ok()
            .map(|_| remote)
    }

    /// Dials with default metadata and the given query parameters.
    pub fn dial_with_query(&self, query: &[(&str, &str)]) -> Option<MemoryRemote> {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let info = query
            .iter()
            .fold(RequestInfo::new(addr), |info, (k, v)| info.with_query(k, v));
        self.dial(info)
    }
}

/// Creates a connected listener/dialer pair.
pub fn listener() -> (MemoryListener, MemoryDialer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryListener { inbound: rx }, MemoryDialer { inbound: tx })
}

impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Inbound, TransportError> {
        self.inbound
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)
    }
}

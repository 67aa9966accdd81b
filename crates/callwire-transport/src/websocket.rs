//! WebSocket channels using `tokio-tungstenite`.
//!
//! Every channel is backed by one I/O task that owns the socket. The
//! [`WebSocketChannel`] handle only pushes commands into that task, and the
//! task reports everything it sees through the channel's event stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::Instrument;

use crate::{
    Channel, ChannelEvent, ChannelEvents, ChannelId, Connector, Inbound,
    Listener, RequestInfo, TransportError, next_channel_id,
};

/// Close frame reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// Commands from a [`WebSocketChannel`] handle to its I/O task.
#[derive(Debug)]
enum Command {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Handle to a WebSocket-backed channel.
#[derive(Debug)]
pub struct WebSocketChannel {
    id: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel for WebSocketChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.commands.send(Command::Frame(data)).map_err(|_| {
            TransportError::ChannelClosed(format!("{} is gone", self.id))
        })
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.commands
            .send(Command::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| {
                TransportError::ChannelClosed(format!(
                    "{} is already closed",
                    self.id
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Opens WebSocket channels to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Creates a connector for a `ws://` or `wss://` URL.
    ///
    /// Query parameters in the URL are passed to the server as-is, which is
    /// how clients identify themselves to the admission handler.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            TransportError::ConnectFailed(format!("invalid url {url}: {e}"))
        })?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(Self {
                url: parsed.to_string(),
            }),
            other => Err(TransportError::ConnectFailed(format!(
                "unsupported scheme {other}, expected ws or wss"
            ))),
        }
    }

    /// Returns the URL this connector dials.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn open(&self) -> (Box<dyn Channel>, ChannelEvents) {
        let id = next_channel_id();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let url = self.url.clone();

        let span = tracing::debug_span!("ws_channel", %id);
        tokio::spawn(
            async move {
                tracing::debug!(%url, "connecting");
                match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        let _ = events_tx.send(ChannelEvent::Connected);
                        run_socket(ws, commands_rx, events_tx).await;
                    }
                    Err(e) => {
                        drop(commands_rx);
                        let reason = format!("connect failed: {e}");
                        let _ = events_tx.send(ChannelEvent::Error(
                            TransportError::ConnectFailed(e.to_string()),
                        ));
                        let _ = events_tx
                            .send(ChannelEvent::Disconnected { reason });
                    }
                }
            }
            .instrument(span),
        );

        let channel = WebSocketChannel {
            id,
            commands: commands_tx,
        };
        (Box::new(channel), events_rx)
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// How long a freshly accepted TCP connection gets to finish the WebSocket
/// upgrade before it is dropped.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A WebSocket [`Listener`] bound to a TCP address.
///
/// Only the TCP accept runs inside [`Listener::accept`]. Each upgrade runs
/// in its own task under a timeout, so a peer that never finishes its
/// handshake cannot hold up the ones behind it.
pub struct WebSocketListener {
    listener: TcpListener,
    handshake_timeout: Duration,
    handshakes: JoinSet<Result<Inbound, TransportError>>,
}

impl WebSocketListener {
    /// Binds a new listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self {
            listener,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshakes: JoinSet::new(),
        })
    }

    /// Sets how long a peer may take to complete the upgrade.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("pending_handshakes", &self.handshakes.len())
            .finish()
    }
}

/// What we keep from the HTTP upgrade request.
#[derive(Debug, Default)]
struct Handshake {
    path: String,
    query: Option<String>,
    origin: Option<String>,
}

impl Listener for WebSocketListener {
    async fn accept(&mut self) -> Result<Inbound, TransportError> {
        loop {
            tokio::select! {
                Some(done) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    match done {
                        Ok(Ok(inbound)) => return Ok(inbound),
                        Ok(Err(e)) => tracing::warn!(error = %e, "WebSocket handshake failed"),
                        Err(e) => tracing::error!(error = %e, "handshake task failed"),
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) =
                        accepted.map_err(TransportError::AcceptFailed)?;
                    tracing::trace!(%remote_addr, "TCP connection accepted");
                    self.handshakes
                        .spawn(upgrade(stream, remote_addr, self.handshake_timeout));
                }
            }
        }
    }
}

/// Runs the server side of the WebSocket upgrade and wires up the channel.
async fn upgrade(
    stream: TcpStream,
    remote_addr: SocketAddr,
    limit: Duration,
) -> Result<Inbound, TransportError> {
    let mut handshake = Handshake::default();
    let upgraded = tokio::time::timeout(
        limit,
        tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            handshake = Handshake {
                path: request.uri().path().to_string(),
                query: request.uri().query().map(str::to_string),
                origin: request
                    .headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            };
            Ok::<_, ErrorResponse>(response)
        }),
    )
    .await;
    let ws = match upgraded {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            return Err(TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{remote_addr}: {e}"),
            )));
        }
        Err(_) => {
            return Err(TransportError::AcceptFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{remote_addr}: no upgrade within {limit:?}"),
            )));
        }
    };

    let id = next_channel_id();
    let info = request_info(handshake, remote_addr);
    tracing::debug!(%id, %remote_addr, path = %info.path, "accepted WebSocket channel");

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _ = events_tx.send(ChannelEvent::Connected);
    tokio::spawn(
        run_socket(ws, commands_rx, events_tx)
            .instrument(tracing::debug_span!("ws_channel", %id)),
    );

    Ok(Inbound {
        channel: Box::new(WebSocketChannel {
            id,
            commands: commands_tx,
        }),
        events: events_rx,
        info,
    })
}

fn request_info(handshake: Handshake, remote_addr: SocketAddr) -> RequestInfo {
    let query: HashMap<String, String> = handshake
        .query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    RequestInfo {
        query,
        path: if handshake.path.is_empty() {
            "/".to_string()
        } else {
            handshake.path
        },
        origin: handshake.origin,
        remote_addr,
    }
}

// ---------------------------------------------------------------------------
// Socket I/O task
// ---------------------------------------------------------------------------

/// Owns the socket until either side closes it, then reports
/// `Disconnected` exactly once.
async fn run_socket<S>(
    ws: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Frame(data)) => {
                    if let Err(e) = sink.send(to_message(data)).await {
                        let _ = events.send(ChannelEvent::Error(
                            TransportError::SendFailed(e.to_string()),
                        ));
                        break format!("send failed: {e}");
                    }
                }
                Some(Command::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: close_code(code),
                        reason: truncate_reason(&reason).to_string().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!(error = %e, "close frame not sent");
                    }
                    break format!("closed locally [code:{code}]");
                }
                None => {
                    let _ = sink.close().await;
                    break "channel handle dropped".to_string();
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ChannelEvent::Message(
                        text.as_bytes().to_vec(),
                    ));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(ChannelEvent::Message(data.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => format!(
                            "closed by peer [code:{}, reason:\"{}\"]",
                            u16::from(f.code),
                            f.reason.as_str()
                        ),
                        None => "closed by peer".to_string(),
                    };
                }
                Some(Ok(_)) => {} // ping/pong/raw frame
                Some(Err(e)) => {
                    let _ = events.send(ChannelEvent::Error(
                        TransportError::ReceiveFailed(e.to_string()),
                    ));
                    break format!("receive failed: {e}");
                }
                None => break "stream ended".to_string(),
            },
        }
    };

    // Sends must fail from here on, before anyone sees the disconnect.
    drop(commands);
    tracing::debug!(%reason, "socket finished");
    let _ = events.send(ChannelEvent::Disconnected { reason });
}

/// Envelopes are JSON, so valid UTF-8 goes out as a text frame.
fn to_message(data: Vec<u8>) -> Message {
    match String::from_utf8(data) {
        Ok(text) => Message::text(text),
        Err(e) => Message::binary(e.into_bytes()),
    }
}

/// Maps an application code onto a valid WebSocket close code. Codes below
/// 1000 (HTTP-style, e.g. 403) land in the private range as `4000 + code`.
fn close_code(code: u16) -> CloseCode {
    if code < 1000 {
        CloseCode::from(4000 + code)
    } else {
        CloseCode::from(code)
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

//! Reconnecting client transport.
//!
//! A [`ClientTransport`] owns one channel at a time and drives it through
//! a background task:
//!
//! ```text
//!            Connected                 Disconnected (was open)
//! Connecting ─────────► Open ─────────────────────────────► Reconnecting
//!     ▲  │                                                     │
//!     │  │ Disconnected (never open)                           │ new cycle,
//!     │  ▼                                                     │ attempt = 0
//!   wait delay(attempt) ◄── Failed{attempt}                    ▼
//!        │                                                 Connecting
//!        └── budget spent ──► Closed
//! ```
//!
//! A channel that never came up is retried on the backoff ladder. A channel
//! that was open and then dropped starts a fresh cycle immediately, with the
//! attempt counter back at zero.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callwire_protocol::{Codec, Envelope, JsonCodec};
use callwire_transport::{Channel, ChannelEvent, ChannelEvents, Connector};
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, info, warn};

use crate::backoff::{BackoffPolicy, Timer, TokioTimer};
use crate::events::{BusEvent, EventBus, Subscription};
use crate::state::{TransportState, wait_closed};
use crate::{SessionError, inbound};

/// Close code sent when the application closes the transport.
const CLIENT_CLOSE_CODE: u16 = 1000;

/// Events published by a [`ClientTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A channel connected; the transport is open.
    Open,
    /// A decoded inbound message.
    Message(Envelope),
    /// A connect attempt failed before the channel ever opened.
    Failed {
        /// 1-based number of the failed attempt in the current cycle.
        attempt: u32,
    },
    /// An open channel dropped; a fresh connect cycle follows.
    Disconnected,
    /// Terminal. Published exactly once.
    Close,
}

/// Discriminant of [`ClientEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Open,
    Message,
    Failed,
    Disconnected,
    Close,
}

impl BusEvent for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            Self::Open => ClientEventKind::Open,
            Self::Message(_) => ClientEventKind::Message,
            Self::Failed { .. } => ClientEventKind::Failed,
            Self::Disconnected => ClientEventKind::Disconnected,
            Self::Close => ClientEventKind::Close,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`ClientTransport`].
///
/// Handlers registered with [`on`](Self::on) are in place before the first
/// channel is opened, so they never miss the first `Open`.
pub struct ClientTransportBuilder<C = JsonCodec> {
    connector: Box<dyn Connector>,
    policy: BackoffPolicy,
    timer: Arc<dyn Timer>,
    codec: C,
    span: Span,
    bus: EventBus<ClientEvent>,
}

impl ClientTransportBuilder<JsonCodec> {
    /// Starts a builder with the default policy, timer and codec.
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Box::new(connector),
            policy: BackoffPolicy::default(),
            timer: Arc::new(TokioTimer),
            codec: JsonCodec,
            span: tracing::info_span!("client_transport"),
            bus: EventBus::new(),
        }
    }
}

impl<C: Codec> ClientTransportBuilder<C> {
    /// Sets the retry policy.
    pub fn retry(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the timer used to wait between attempts.
    pub fn timer(mut self, timer: impl Timer) -> Self {
        self.timer = Arc::new(timer);
        self
    }

    /// Replaces the codec.
    pub fn codec<C2: Codec>(self, codec: C2) -> ClientTransportBuilder<C2> {
        ClientTransportBuilder {
            connector: self.connector,
            policy: self.policy,
            timer: self.timer,
            codec,
            span: self.span,
            bus: self.bus,
        }
    }

    /// Span that every log line of this transport is recorded in.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Registers a handler before the transport starts.
    pub fn on<F>(self, kind: ClientEventKind, handler: F) -> Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler);
        self
    }

    /// Spawns the connection driver and returns the transport handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(self) -> ClientTransport<C> {
        let (closed, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            lifecycle: Mutex::new(Lifecycle {
                state: TransportState::Connecting,
                channel: None,
                attempt: 0,
                ever_connected: false,
            }),
            bus: self.bus,
            codec: self.codec,
            closed,
            span: self.span.clone(),
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            connector: self.connector,
            policy: self.policy.validated(),
            timer: self.timer,
            closed: closed_rx,
        };
        tokio::spawn(driver.run().instrument(self.span));

        ClientTransport { shared }
    }
}

impl<C> fmt::Debug for ClientTransportBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransportBuilder")
            .field("policy", &self.policy)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ClientTransport
// ---------------------------------------------------------------------------

/// Handle to a reconnecting client transport.
///
/// Dropping the handle closes the transport.
pub struct ClientTransport<C = JsonCodec> {
    shared: Arc<Shared<C>>,
}

impl ClientTransport<JsonCodec> {
    /// Shorthand for [`ClientTransportBuilder::new`].
    pub fn builder(connector: impl Connector) -> ClientTransportBuilder<JsonCodec> {
        ClientTransportBuilder::new(connector)
    }
}

impl<C: Codec> ClientTransport<C> {
    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        self.shared.lifecycle().state
    }

    /// Whether [`close`](Self::close) ran, explicitly or on exhaustion.
    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Failed attempts in the current connect cycle.
    pub fn attempt(&self) -> u32 {
        self.shared.lifecycle().attempt
    }

    /// Registers an event handler.
    pub fn subscribe<F>(&self, kind: ClientEventKind, handler: F) -> Subscription<ClientEventKind>
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(kind, handler)
    }

    /// Removes an event handler.
    pub fn unsubscribe(&self, subscription: Subscription<ClientEventKind>) -> bool {
        self.shared.bus.unsubscribe(subscription)
    }

    /// Number of handlers registered for `kind`.
    pub fn listener_count(&self, kind: ClientEventKind) -> usize {
        self.shared.bus.listener_count(kind)
    }

    /// Encodes and sends an envelope on the current channel.
    ///
    /// # Errors
    /// - [`SessionError::Closed`] after [`close`](Self::close)
    /// - [`SessionError::NotOpen`] while connecting or reconnecting
    /// - encode or channel errors as they happen
    pub fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        self.shared.send(envelope)
    }

    /// Closes the transport. Idempotent.
    ///
    /// State and the `Close` event are observable before this returns;
    /// channel teardown happens afterwards in the background.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<C> fmt::Debug for ClientTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.shared.lifecycle();
        f.debug_struct("ClientTransport")
            .field("state", &lifecycle.state)
            .field("attempt", &lifecycle.attempt)
            .field("channel", &lifecycle.channel.as_ref().map(|c| c.id()))
            .finish()
    }
}

impl<C> Drop for ClientTransport<C> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: TransportState,
    channel: Option<Box<dyn Channel>>,
    attempt: u32,
    ever_connected: bool,
}

/// What the driver does after a channel went away.
#[derive(Debug, Clone, Copy)]
enum Next {
    /// It had been open: start a fresh cycle now.
    Restart,
    /// It never opened: back off, then retry.
    Retry(u32),
    /// The transport is closed.
    Stop,
}

struct Shared<C> {
    lifecycle: Mutex<Lifecycle>,
    bus: EventBus<ClientEvent>,
    codec: C,
    closed: watch::Sender<bool>,
    span: Span,
}

impl<C> Shared<C> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lifecycle().state == TransportState::Closed
    }

    fn close(&self) {
        let channel = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransportState::Closed {
                return;
            }
            lifecycle.state = TransportState::Closed;
            lifecycle.channel.take()
        };
        let _enter = self.span.enter();
        info!("transport closed");
        self.closed.send_replace(true);
        self.bus.publish(&ClientEvent::Close);

        if let Some(channel) = channel {
            if let Err(e) = channel.close(CLIENT_CLOSE_CODE, "closed by client") {
                warn!(channel = %channel.id(), error = %e, "channel teardown failed");
            }
        }
    }

    /// Makes `channel` the current one, unless the transport closed in the
    /// meantime.
    fn install(&self, channel: Box<dyn Channel>) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == TransportState::Closed {
            drop(lifecycle);
            if let Err(e) = channel.close(CLIENT_CLOSE_CODE, "closed by client") {
                debug!(channel = %channel.id(), error = %e, "late channel teardown failed");
            }
            return false;
        }
        if lifecycle.state == TransportState::Reconnecting {
            lifecycle.state = TransportState::Connecting;
        }
        lifecycle.channel = Some(channel);
        true
    }

    fn opened(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransportState::Closed {
                return;
            }
            lifecycle.state = TransportState::Open;
            lifecycle.attempt = 0;
            lifecycle.ever_connected = true;
        }
        info!("transport open");
        self.bus.publish(&ClientEvent::Open);
    }

    fn dropped(&self) -> Next {
        let (next, channel) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransportState::Closed {
                return Next::Stop;
            }
            let channel = lifecycle.channel.take();
            let next = if lifecycle.ever_connected {
                lifecycle.ever_connected = false;
                lifecycle.attempt = 0;
                lifecycle.state = TransportState::Reconnecting;
                Next::Restart
            } else {
                lifecycle.attempt += 1;
                Next::Retry(lifecycle.attempt)
            };
            (next, channel)
        };
        drop(channel);

        match next {
            Next::Restart => {
                self.bus.publish(&ClientEvent::Disconnected);
            }
            Next::Retry(attempt) => {
                self.bus.publish(&ClientEvent::Failed { attempt });
            }
            Next::Stop => {}
        }
        next
    }
}

impl<C: Codec> Shared<C> {
    fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            TransportState::Closed => return Err(SessionError::Closed),
            TransportState::Open => {}
            other => return Err(SessionError::NotOpen(other)),
        }
        let channel = lifecycle
            .channel
            .as_ref()
            .ok_or(SessionError::NotOpen(lifecycle.state))?;
        let bytes = envelope.encode(&self.codec)?;
        channel.send(bytes)?;
        Ok(())
    }

    fn received(&self, raw: &[u8]) {
        if self.is_closed() {
            return;
        }
        inbound::deliver(
            &self.bus,
            &self.codec,
            raw,
            ClientEventKind::Message,
            ClientEvent::Message,
        );
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// How a channel's event stream ended.
enum Outcome {
    /// The transport was closed locally.
    Closed,
    /// The channel went away on its own.
    Dropped,
}

/// Background task that opens channels and reacts to their events.
struct Driver<C> {
    shared: Arc<Shared<C>>,
    connector: Box<dyn Connector>,
    policy: BackoffPolicy,
    timer: Arc<dyn Timer>,
    closed: watch::Receiver<bool>,
}

impl<C: Codec> Driver<C> {
    async fn run(mut self) {
        loop {
            let (channel, mut events) = self.connector.open();
            debug!(channel = %channel.id(), "opening channel");
            if !self.shared.install(channel) {
                return;
            }
            if let Outcome::Closed = self.pump(&mut events).await {
                return;
            }
            drop(events);

            match self.shared.dropped() {
                Next::Stop => return,
                Next::Restart => {
                    info!("connection lost, reconnecting");
                }
                Next::Retry(attempt) => {
                    let Some(delay) = self.policy.delay(attempt) else {
                        warn!(attempt, "connect attempts exhausted, giving up");
                        self.shared.close();
                        return;
                    };
                    debug!(attempt, ?delay, "connect attempt failed, retrying");
                    tokio::select! {
                        biased;
                        () = wait_closed(&mut self.closed) => return,
                        () = self.timer.sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn pump(&mut self, events: &mut ChannelEvents) -> Outcome {
        loop {
            let event = tokio::select! {
                biased;
                () = wait_closed(&mut self.closed) => return Outcome::Closed,
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Connected) => self.shared.opened(),
                Some(ChannelEvent::Message(raw)) => self.shared.received(&raw),
                Some(ChannelEvent::Error(e)) => warn!(error = %e, "channel error"),
                Some(ChannelEvent::Disconnected { reason }) => {
                    debug!(%reason, "channel disconnected");
                    return Outcome::Dropped;
                }
                None => return Outcome::Dropped,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(ClientEvent::Open.kind(), ClientEventKind::Open);
        assert_eq!(
            ClientEvent::Failed { attempt: 3 }.kind(),
            ClientEventKind::Failed
        );
        assert_eq!(ClientEvent::Disconnected.kind(), ClientEventKind::Disconnected);
        assert_eq!(ClientEvent::Close.kind(), ClientEventKind::Close);
        assert_eq!(
            ClientEvent::Message(Envelope::notification("n", serde_json::Value::Null)).kind(),
            ClientEventKind::Message
        );
    }
}

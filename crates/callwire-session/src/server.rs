//! Server-side transport over an admitted inbound channel.
//!
//! No reconnection here: when the channel drops the transport closes.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callwire_protocol::{Codec, Envelope, JsonCodec};
use callwire_transport::{
    Channel, ChannelEvent, ChannelEvents, ChannelId, RequestInfo, TransportError,
};
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, info, warn};

use crate::events::{BusEvent, EventBus, Subscription};
use crate::state::{TransportState, wait_closed};
use crate::{SessionError, inbound};

/// Close code sent when the server closes a transport.
pub const SERVER_CLOSE_CODE: u16 = 4000;

/// Events published by a [`ServerTransport`].
#[derive(Debug)]
pub enum ServerEvent {
    /// A decoded inbound message.
    Message(Envelope),
    /// A channel error. The transport closes right after publishing it.
    Error(TransportError),
    /// Terminal. Published exactly once.
    Close,
}

/// Discriminant of [`ServerEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    Message,
    Error,
    Close,
}

impl BusEvent for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Message(_) => ServerEventKind::Message,
            Self::Error(_) => ServerEventKind::Error,
            Self::Close => ServerEventKind::Close,
        }
    }
}

/// A logical transport wrapping one accepted channel.
///
/// Created in the `Open` state. Call [`start`](Self::start) once handlers
/// are registered; inbound messages are only read from then on, so nothing
/// arrives before anyone listens. Dropping the transport closes it.
pub struct ServerTransport<C = JsonCodec> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    id: ChannelId,
    info: RequestInfo,
    state: Mutex<TransportState>,
    channel: Box<dyn Channel>,
    events: Mutex<Option<ChannelEvents>>,
    bus: EventBus<ServerEvent>,
    codec: C,
    closed: watch::Sender<bool>,
    span: Span,
}

impl<C: Codec> ServerTransport<C> {
    /// Wraps an accepted channel.
    pub fn new(
        channel: Box<dyn Channel>,
        events: ChannelEvents,
        info: RequestInfo,
        codec: C,
        span: Span,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: channel.id(),
                info,
                state: Mutex::new(TransportState::Open),
                channel,
                events: Mutex::new(Some(events)),
                bus: EventBus::new(),
                codec,
                closed,
                span,
            }),
        }
    }

    /// Starts reading channel events. Calls after the first are no-ops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(events) = events else {
            return;
        };
        let closed = self.inner.closed.subscribe();
        let inner = Arc::clone(&self.inner);
        let span = self.inner.span.clone();
        tokio::spawn(read_loop(inner, events, closed).instrument(span));
    }

    /// Id of the underlying channel.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Handshake metadata the channel was accepted with.
    pub fn info(&self) -> &RequestInfo {
        &self.inner.info
    }

    /// Current lifecycle state: `Open` or `Closed`.
    pub fn state(&self) -> TransportState {
        *self.inner.state()
    }

    /// Whether the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == TransportState::Closed
    }

    /// Registers an event handler.
    pub fn subscribe<F>(&self, kind: ServerEventKind, handler: F) -> Subscription<ServerEventKind>
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    /// Removes an event handler.
    pub fn unsubscribe(&self, subscription: Subscription<ServerEventKind>) -> bool {
        self.inner.bus.unsubscribe(subscription)
    }

    /// Number of handlers registered for `kind`.
    pub fn listener_count(&self, kind: ServerEventKind) -> usize {
        self.inner.bus.listener_count(kind)
    }

    /// Encodes and sends an envelope.
    ///
    /// # Errors
    /// [`SessionError::Closed`] once closed, otherwise encode or channel
    /// errors.
    pub fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let bytes = envelope.encode(&self.inner.codec)?;
        self.inner.channel.send(bytes)?;
        Ok(())
    }

    /// Closes the transport and the channel with code 4000. Idempotent.
    pub fn close(&self) {
        self.inner.shut_down("closed by server");
    }
}

impl<C> fmt::Debug for ServerTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransport")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state())
            .field("remote_addr", &self.inner.info.remote_addr)
            .finish()
    }
}

impl<C> Drop for ServerTransport<C> {
    fn drop(&mut self) {
        self.inner.shut_down("closed by server");
    }
}

impl<C> Inner<C> {
    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flips to `Closed` and publishes `Close`. Returns `false` if it was
    /// already closed.
    fn mark_closed(&self) -> bool {
        {
            let mut state = self.state();
            if *state == TransportState::Closed {
                return false;
            }
            *state = TransportState::Closed;
        }
        let _enter = self.span.enter();
        info!(channel = %self.id, "transport closed");
        self.closed.send_replace(true);
        self.bus.publish(&ServerEvent::Close);
        true
    }

    /// Closes the transport and asks the channel to close with
    /// [`SERVER_CLOSE_CODE`].
    fn shut_down(&self, reason: &str) {
        if self.mark_closed() {
            let _enter = self.span.enter();
            if let Err(e) = self.channel.close(SERVER_CLOSE_CODE, reason) {
                warn!(error = %e, "channel teardown failed");
            }
        }
    }
}

async fn read_loop<C: Codec>(
    inner: Arc<Inner<C>>,
    mut events: ChannelEvents,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = wait_closed(&mut closed) => return,
            event = events.recv() => event,
        };
        match event {
            Some(ChannelEvent::Message(raw)) => {
                if *inner.state() == TransportState::Closed {
                    return;
                }
                inbound::deliver(
                    &inner.bus,
                    &inner.codec,
                    &raw,
                    ServerEventKind::Message,
                    ServerEvent::Message,
                );
            }
            Some(ChannelEvent::Error(e)) => {
                warn!(error = %e, "channel error");
                inner.bus.publish(&ServerEvent::Error(e));
                inner.shut_down("channel error");
                return;
            }
            Some(ChannelEvent::Connected) => {}
            Some(ChannelEvent::Disconnected { reason }) => {
                debug!(%reason, "channel disconnected");
                inner.mark_closed();
                return;
            }
            None => {
                inner.mark_closed();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kinds() {
        assert_eq!(ServerEvent::Close.kind(), ServerEventKind::Close);
        assert_eq!(
            ServerEvent::Error(TransportError::ReceiveFailed("x".into())).kind(),
            ServerEventKind::Error
        );
    }
}

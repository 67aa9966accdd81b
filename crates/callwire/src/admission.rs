//! Server-side admission: deciding whether an inbound channel becomes a
//! [`ServerTransport`].
//!
//! Every accepted channel is wrapped in a [`ConnectionRequest`] and
//! published to the gate's handlers. Exactly one decision counts: the first
//! `accept()` or `reject()` wins, later calls only log a warning. A request
//! that is dropped without a decision is rejected with the default code.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callwire_protocol::{Codec, JsonCodec};
use callwire_session::{BusEvent, EventBus, ServerTransport, Subscription};
use callwire_transport::{Channel, ChannelEvents, Inbound, RequestInfo};
use tracing::{Span, debug, error, info, warn};

use crate::AdmissionError;

/// Code used when a rejection does not name one.
pub const DEFAULT_REJECT_CODE: u16 = 403;

/// Reason used when a rejection does not give one.
pub const DEFAULT_REJECT_REASON: &str = "Rejected";

/// Code used when rejecting with an error value.
pub const ERROR_REJECT_CODE: u16 = 500;

/// A normalized rejection, as sent to the peer in the close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl Rejection {
    /// Fills in defaults: a missing or zero code becomes 403, a missing or
    /// empty reason becomes `"Rejected"`.
    pub fn new(code: Option<u16>, reason: Option<&str>) -> Self {
        Self {
            code: code.filter(|&c| c != 0).unwrap_or(DEFAULT_REJECT_CODE),
            reason: reason
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REJECT_REASON)
                .to_string(),
        }
    }

    /// A 500 rejection carrying the error's text.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(Some(ERROR_REJECT_CODE), Some(&err.to_string()))
    }
}

impl Default for Rejection {
    fn default() -> Self {
        Self::new(None, None)
    }
}

// ---------------------------------------------------------------------------
// ConnectionRequest
// ---------------------------------------------------------------------------

struct Pending<C> {
    channel: Box<dyn Channel>,
    events: ChannelEvents,
    codec: C,
}

struct Slot<C> {
    pending: Mutex<Option<Pending<C>>>,
    info: RequestInfo,
    span: Span,
}

impl<C> Slot<C> {
    /// Takes the channel out, marking the request as replied.
    fn take(&self) -> Option<Pending<C>> {
        self.pending().take()
    }

    fn pending(&self) -> MutexGuard<'_, Option<Pending<C>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> Drop for Slot<C> {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            let _enter = self.span.enter();
            debug!("connection request dropped without a decision, rejecting");
            let rejection = Rejection::default();
            if let Err(e) = pending.channel.close(rejection.code, &rejection.reason) {
                debug!(error = %e, "closing undecided channel failed");
            }
        }
    }
}

/// An inbound channel waiting for an admission decision.
///
/// Cheap to clone; all clones share the same single decision. Keep a clone
/// around to decide later; once the last clone is dropped undecided, the
/// channel is rejected.
pub struct ConnectionRequest<C = JsonCodec> {
    slot: Arc<Slot<C>>,
}

impl<C> Clone for ConnectionRequest<C> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C: Codec> ConnectionRequest<C> {
    fn new(inbound: Inbound, codec: C, span: Span) -> Self {
        Self {
            slot: Arc::new(Slot {
                pending: Mutex::new(Some(Pending {
                    channel: inbound.channel,
                    events: inbound.events,
                    codec,
                })),
                info: inbound.info,
                span,
            }),
        }
    }

    /// Handshake metadata: query parameters, path, origin, peer address.
    pub fn info(&self) -> &RequestInfo {
        &self.slot.info
    }

    /// Whether a decision was already made.
    pub fn is_replied(&self) -> bool {
        self.slot.pending().is_none()
    }

    /// Promotes the channel to a [`ServerTransport`].
    ///
    /// Register handlers on the returned transport, then call
    /// [`ServerTransport::start`]. Returns `None` (and logs a warning) if
    /// the request was already replied.
    pub fn accept(&self) -> Option<ServerTransport<C>> {
        let _enter = self.slot.span.enter();
        let Some(pending) = self.slot.take() else {
            warn!("cannot call accept(), connection request already replied");
            return None;
        };
        info!("connection accepted");
        Some(ServerTransport::new(
            pending.channel,
            pending.events,
            self.slot.info.clone(),
            pending.codec,
            self.slot.span.clone(),
        ))
    }

    /// Refuses the channel and closes it with the normalized code and
    /// reason.
    ///
    /// Returns the rejection that was sent, or `None` (and logs a warning)
    /// if the request was already replied.
    pub fn reject(&self, code: Option<u16>, reason: Option<&str>) -> Option<Rejection> {
        self.reject_with(Rejection::new(code, reason))
    }

    /// Refuses the channel with code 500 and the error's text as reason.
    pub fn reject_with_error(
        &self,
        err: &(dyn std::error::Error + 'static),
    ) -> Option<Rejection> {
        self.reject_with(Rejection::from_error(err))
    }

    fn reject_with(&self, rejection: Rejection) -> Option<Rejection> {
        let _enter = self.slot.span.enter();
        let Some(pending) = self.slot.take() else {
            warn!("cannot call reject(), connection request already replied");
            return None;
        };
        info!(code = rejection.code, reason = %rejection.reason, "connection rejected");
        if let Err(e) = pending.channel.close(rejection.code, &rejection.reason) {
            debug!(error = %e, "closing rejected channel failed");
        }
        Some(rejection)
    }
}

impl<C> fmt::Debug for ConnectionRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("info", &self.slot.info)
            .field("replied", &self.slot.pending().is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AdmissionGate
// ---------------------------------------------------------------------------

/// Events published by an [`AdmissionGate`].
#[derive(Debug)]
pub enum AdmissionEvent<C = JsonCodec> {
    /// An inbound channel is waiting for a decision.
    ConnectionRequest(ConnectionRequest<C>),
}

/// Discriminant of [`AdmissionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionEventKind {
    ConnectionRequest,
}

impl<C: Codec> BusEvent for AdmissionEvent<C> {
    type Kind = AdmissionEventKind;

    fn kind(&self) -> AdmissionEventKind {
        match self {
            Self::ConnectionRequest(_) => AdmissionEventKind::ConnectionRequest,
        }
    }
}

/// Turns inbound channels into connection requests for the application.
pub struct AdmissionGate<C: Codec = JsonCodec> {
    bus: EventBus<AdmissionEvent<C>>,
    codec: C,
    span: Span,
}

impl AdmissionGate<JsonCodec> {
    /// Creates a gate using [`JsonCodec`] for admitted transports.
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl Default for AdmissionGate<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> AdmissionGate<C> {
    /// Creates a gate whose admitted transports use `codec`.
    pub fn with_codec(codec: C) -> Self {
        Self {
            bus: EventBus::new(),
            codec,
            span: tracing::info_span!("admission"),
        }
    }

    /// Parent span for every connection's log lines.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Registers the decision maker.
    pub fn on_connection_request<F>(&self, handler: F) -> Subscription<AdmissionEventKind>
    where
        F: Fn(&ConnectionRequest<C>) + Send + Sync + 'static,
    {
        self.bus
            .subscribe(AdmissionEventKind::ConnectionRequest, move |event| {
                let AdmissionEvent::ConnectionRequest(request) = event;
                handler(request);
            })
    }

    /// The gate's event bus, for unsubscribing or counting handlers.
    pub fn events(&self) -> &EventBus<AdmissionEvent<C>> {
        &self.bus
    }

    /// Publishes a connection request for `inbound`.
    ///
    /// # Errors
    /// [`AdmissionError::NoHandler`] when nothing is subscribed; the channel
    /// is closed and no transport is created.
    pub fn handle(&self, inbound: Inbound) -> Result<(), AdmissionError> {
        let span = tracing::info_span!(
            parent: &self.span,
            "connection",
            channel = %inbound.channel.id(),
            remote = %inbound.info.remote_addr,
        );

        if self.bus.listener_count(AdmissionEventKind::ConnectionRequest) == 0 {
            let _enter = span.enter();
            error!("no handler for \"connectionrequest\" event, closing channel");
            if let Err(e) = inbound
                .channel
                .close(ERROR_REJECT_CODE, "no connection request handler")
            {
                warn!(error = %e, "closing unhandled channel failed");
            }
            return Err(AdmissionError::NoHandler);
        }

        let request = ConnectionRequest::new(inbound, self.codec.clone(), span);
        self.bus.publish(&AdmissionEvent::ConnectionRequest(request));
        Ok(())
    }
}

impl<C: Codec> fmt::Debug for AdmissionGate<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("handlers", &self.bus)
            .finish_non_exhaustive()
    }
}

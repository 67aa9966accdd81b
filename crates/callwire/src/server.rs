//! `HubServer` builder and accept loop.
//!
//! The hub accepts inbound channels and hands each one to its
//! [`AdmissionGate`]. What happens next is up to the gate's
//! connection-request handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use callwire_protocol::{Codec, JsonCodec};
use callwire_transport::{
    DEFAULT_HANDSHAKE_TIMEOUT, Listener, TransportError, WebSocketListener,
};
use tokio::sync::watch;
use tracing::{Instrument, Span};

use crate::{AdmissionGate, CallwireError};

/// Builder for a WebSocket [`HubServer`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::{Arc, Mutex};
/// use callwire::prelude::*;
///
/// # async fn run() -> Result<(), CallwireError> {
/// let server = HubServer::builder().bind("0.0.0.0:4443").build().await?;
/// let peers = Arc::new(Mutex::new(Vec::new()));
/// let registry = Arc::clone(&peers);
/// server.gate().on_connection_request(move |request| {
///     if request.info().query_param("peerId").is_none() {
///         request.reject(Some(400), Some("missing peerId"));
///     } else if let Some(transport) = request.accept() {
///         transport.start();
///         registry.lock().unwrap().push(transport);
///     }
/// });
/// server.run().await
/// # }
/// ```
#[derive(Debug)]
pub struct HubServerBuilder {
    bind_addr: String,
    handshake_timeout: Duration,
    span: Span,
}

impl HubServerBuilder {
    /// Creates a builder bound to `127.0.0.1:8080`.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            span: tracing::info_span!("hub"),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets how long a peer may take to finish the WebSocket upgrade.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the span the server and every admitted connection log under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Binds the listener.
    pub async fn build(self) -> Result<HubServer<WebSocketListener>, CallwireError> {
        let listener = WebSocketListener::bind(&self.bind_addr)
            .await?
            .with_handshake_timeout(self.handshake_timeout);
        let gate = AdmissionGate::new().with_span(self.span.clone());
        Ok(HubServer::new(listener, gate).with_span(self.span))
    }
}

impl Default for HubServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops a running [`HubServer`] from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Makes [`HubServer::run`] return. Already admitted transports are
    /// not affected.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Accepts inbound channels and runs them through admission.
pub struct HubServer<L, C: Codec = JsonCodec> {
    listener: L,
    gate: Arc<AdmissionGate<C>>,
    stop: Arc<watch::Sender<bool>>,
    span: Span,
}

impl HubServer<WebSocketListener> {
    /// Creates a new builder.
    pub fn builder() -> HubServerBuilder {
        HubServerBuilder::new()
    }
}

impl<C: Codec> HubServer<WebSocketListener, C> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl<L: Listener, C: Codec> HubServer<L, C> {
    /// Wraps any listener.
    pub fn new(listener: L, gate: AdmissionGate<C>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            listener,
            gate: Arc::new(gate),
            stop: Arc::new(stop),
            span: tracing::info_span!("hub"),
        }
    }

    /// Sets the span the accept loop logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The gate inbound channels are published on.
    pub fn gate(&self) -> &Arc<AdmissionGate<C>> {
        &self.gate
    }

    /// Returns a handle that stops [`run`](Self::run).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Runs the accept loop until stopped or the listener closes.
    ///
    /// Accept failures and admission failures are logged; neither ends the
    /// loop.
    pub async fn run(self) -> Result<(), CallwireError> {
        let span = self.span.clone();
        self.accept_loop().instrument(span).await
    }

    async fn accept_loop(mut self) -> Result<(), CallwireError> {
        let mut stopped = self.stop.subscribe();
        tracing::info!("hub server running");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stopped.wait_for(|&stop| stop) => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok(inbound) => {
                    if let Err(e) = self.gate.handle(inbound) {
                        tracing::warn!(error = %e, "inbound channel not admitted");
                    }
                }
                Err(TransportError::ListenerClosed) => {
                    tracing::info!("listener closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        tracing::info!("hub server stopped");
        Ok(())
    }
}

impl<L, C: Codec> std::fmt::Debug for HubServer<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServer")
            .field("gate", &self.gate)
            .field("stopped", &*self.stop.borrow())
            .finish_non_exhaustive()
    }
}

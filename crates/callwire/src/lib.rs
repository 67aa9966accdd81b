//! # Callwire
//!
//! Real-time signaling transports: request/response and notification
//! envelopes over reconnecting WebSocket channels.
//!
//! - **Client side**: [`ClientTransport`](prelude::ClientTransport) keeps a
//!   channel open, backing off between failed attempts and restarting from
//!   scratch when an established connection drops.
//! - **Server side**: [`HubServer`] accepts channels and hands each to an
//!   [`AdmissionGate`], whose handler decides once per channel whether it
//!   becomes a [`ServerTransport`](prelude::ServerTransport).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callwire::prelude::*;
//!
//! # async fn run() -> Result<(), CallwireError> {
//! callwire::init_tracing();
//!
//! let connector = WebSocketConnector::new("ws://127.0.0.1:4443/?peerId=alice")?;
//! let client = ClientTransport::builder(connector)
//!     .on(ClientEventKind::Message, |event| {
//!         if let ClientEvent::Message(envelope) = event {
//!             println!("received {envelope:?}");
//!         }
//!     })
//!     .connect();
//!
//! // ... once open:
//! client.send(&Envelope::notification("ping", serde_json::Value::Null))?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod error;
mod logging;
mod server;

pub use admission::{
    AdmissionEvent, AdmissionEventKind, AdmissionGate, ConnectionRequest, DEFAULT_REJECT_CODE,
    DEFAULT_REJECT_REASON, ERROR_REJECT_CODE, Rejection,
};
pub use error::{AdmissionError, CallwireError};
pub use logging::{DEFAULT_FILTER, init_tracing};
pub use server::{HubServer, HubServerBuilder, StopHandle};

/// Everything needed to run a client or a hub.
pub mod prelude {
    pub use crate::{
        AdmissionError, AdmissionGate, CallwireError, ConnectionRequest, HubServer,
        HubServerBuilder, Rejection, StopHandle,
    };
    pub use callwire_protocol::{Envelope, JsonCodec, Notification, Request, Response};
    pub use callwire_session::{
        BackoffPolicy, ClientEvent, ClientEventKind, ClientTransport, ServerEvent,
        ServerEventKind, ServerTransport, SessionError, TransportState,
    };
    pub use callwire_transport::{RequestInfo, WebSocketConnector};
}

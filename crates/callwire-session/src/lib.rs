//! Logical transports for callwire.
//!
//! This crate turns raw channels into long-lived, event-driven transports:
//!
//! 1. **Event bus** ([`EventBus`]): per-transport publish/subscribe with
//!    panic-isolated handlers
//! 2. **Client transport** ([`ClientTransport`]): reconnects on its own,
//!    backing off per [`BackoffPolicy`] until it gives up
//! 3. **Server transport** ([`ServerTransport`]): wraps one admitted inbound
//!    channel and closes when it drops
//!
//! # How it fits in the stack
//!
//! ```text
//! Admission (above)   ← promotes accepted channels to ServerTransports
//!     ↕
//! Session Layer (this crate)  ← lifecycle, reconnection, dispatch
//!     ↕
//! Protocol / Transport (below)  ← envelopes, raw channels
//! ```

mod backoff;
mod client;
mod error;
mod events;
mod inbound;
mod server;
mod state;

pub use backoff::{BackoffPolicy, Timer, TokioTimer};
pub use client::{ClientEvent, ClientEventKind, ClientTransport, ClientTransportBuilder};
pub use error::SessionError;
pub use events::{BusEvent, EventBus, Subscription};
pub use server::{SERVER_CLOSE_CODE, ServerEvent, ServerEventKind, ServerTransport};
pub use state::TransportState;

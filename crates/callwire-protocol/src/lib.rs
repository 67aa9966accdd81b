//! Wire protocol for callwire.
//!
//! This crate defines what travels over a channel once it is up:
//!
//! - **Types** ([`Envelope`], [`Request`], [`Response`], [`Notification`]):
//!   the three message kinds and their correlation rules.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`], [`parse`]): how envelopes
//!   are converted to and from bytes.
//! - **Errors** ([`ProtocolError`]): why a payload was rejected.
//!
//! ```text
//! Channel (bytes) → Protocol (Envelope) → Session (events to listeners)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec, parse};
pub use error::ProtocolError;
pub use types::{Envelope, Notification, Request, Response};

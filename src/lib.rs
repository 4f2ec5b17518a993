#![forbid(unsafe_code)]

//! Minimal, pluggable network session framework.
//!
//! Message framing and serialization are supplied by user
//! [`Protocol`]/[`Codec`] implementations; around them the crate provides
//! per-connection [`Session`]s (optional bounded send queue, idempotent
//! close, close-callback registry), a sharded [`Manager`] with a
//! graceful-shutdown barrier, keyed [`Channel`] session groups with
//! auto-eviction, and a thin TCP [`Server`]/[`dial`] layer.

pub mod channel;
pub mod codec;
pub mod error;
pub mod manager;
pub mod net;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_support;

pub use channel::Channel;
pub use codec::{Codec, DrainSendQueue, Protocol, ProtocolFn, protocol_fn};
pub use error::{CodecError, ConnectError, SessionError};
pub use manager::Manager;
pub use net::{BackoffPolicy, dial, dial_timeout};
pub use server::{Handler, HandlerFn, Server, ServerConfig, handler_fn, listen};
pub use session::{Session, StateSlot};

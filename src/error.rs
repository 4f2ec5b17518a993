//! Error types for sessions, codecs, and connection establishment.

use thiserror::Error;

/// Terminal failures surfaced by a [`Codec`](crate::codec::Codec).
///
/// Any codec error ends the session that observed it: the session closes
/// itself and hands the error back to whoever triggered the failing
/// operation.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("message type not registered with this codec")]
    UnregisteredMessage,
}

/// Failures of session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session's closed flag was already set.
    #[error("session closed")]
    Closed,
    /// An async send found the queue full. The session has been closed as a
    /// side effect: a stalled consumer must not grow memory or block the
    /// producer.
    #[error("session blocked")]
    Blocked,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failures while dialing a remote endpoint.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

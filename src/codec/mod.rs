//! Protocol and codec contracts consumed by the session core.

use crossbeam::channel::Receiver;

use crate::error::CodecError;

pub mod json;

/// Framing and (de)serialization over one byte stream.
///
/// A codec is owned by exactly one [`Session`](crate::session::Session).
/// The session serializes calls to `receive` and to `send`, but `receive`,
/// `send`, and `close` may run concurrently with each other, so
/// implementations take `&self` and guard their reader and writer halves
/// independently.
///
/// `close` must release the underlying stream in a way that unblocks a
/// pending `receive` (for TCP, `shutdown(Both)`).
pub trait Codec: Send + Sync + 'static {
    type Msg: Send + 'static;

    /// Blocks until one framed message is decoded. Any error is terminal
    /// for the owning session.
    fn receive(&self) -> Result<Self::Msg, CodecError>;

    /// Serializes and writes one framed message. Any error is terminal.
    fn send(&self, msg: Self::Msg) -> Result<(), CodecError>;

    fn close(&self) -> Result<(), CodecError>;

    /// Capability probe, queried once during session close. Codecs that
    /// pool resources held by queued messages return `Some(self)` to
    /// receive the closed send queue for a final drain.
    fn as_drain(&self) -> Option<&dyn DrainSendQueue<Msg = Self::Msg>> {
        None
    }
}

/// Optional codec capability: reclaim messages left in the send queue when
/// the session closes. The receiver handed over is already disconnected
/// from its producer and yields only the residual buffered messages.
pub trait DrainSendQueue {
    type Msg;

    fn drain_send_queue(&self, pending: Receiver<Self::Msg>);
}

/// Factory producing a [`Codec`] for one byte stream.
pub trait Protocol<S>: Send + Sync + 'static {
    type Codec: Codec;

    fn new_codec(&self, stream: S) -> Result<Self::Codec, CodecError>;
}

/// Adapts a plain function into a [`Protocol`].
pub fn protocol_fn<F>(f: F) -> ProtocolFn<F> {
    ProtocolFn(f)
}

pub struct ProtocolFn<F>(F);

impl<S, C, F> Protocol<S> for ProtocolFn<F>
where
    C: Codec,
    F: Fn(S) -> Result<C, CodecError> + Send + Sync + 'static,
{
    type Codec = C;

    fn new_codec(&self, stream: S) -> Result<C, CodecError> {
        (self.0)(stream)
    }
}

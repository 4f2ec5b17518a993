//! Connection establishment helpers and the accept-loop error policy.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::codec::Protocol;
use crate::error::ConnectError;
use crate::session::Session;

/// Connects to `addr`, builds a codec, and returns a session bound to no
/// manager; the caller owns its lifetime.
pub fn dial<A, P>(
    addr: A,
    protocol: &P,
    send_queue_size: usize,
) -> Result<Arc<Session<P::Codec>>, ConnectError>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream>,
{
    let stream = TcpStream::connect(addr)?;
    let codec = protocol.new_codec(stream)?;
    Ok(Session::new(codec, send_queue_size))
}

/// As [`dial`], failing any candidate address that cannot be connected
/// within `timeout`.
pub fn dial_timeout<A, P>(
    addr: A,
    timeout: Duration,
    protocol: &P,
    send_queue_size: usize,
) -> Result<Arc<Session<P::Codec>>, ConnectError>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream>,
{
    let mut last_err = None;
    for candidate in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                let codec = protocol.new_codec(stream)?;
                return Ok(Session::new(codec, send_queue_size));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(ConnectError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses resolved")
    })))
}

/// Retry schedule for transient accept errors: doubles from `base` up to
/// `max` per consecutive occurrence.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        }
    }
}

pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One accept with the loop's error policy. The listener must be in
/// nonblocking mode. Returns `Ok(None)` once `shutdown` is observed: the
/// flag is this crate's stand-in for the platform's closed-listener
/// signal, and a closed listener is end-of-stream, not an error.
pub(crate) fn accept(
    listener: &TcpListener,
    shutdown: &AtomicBool,
    backoff: &mut Backoff,
) -> io::Result<Option<TcpStream>> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                backoff.reset();
                return Ok(Some(stream));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if is_transient(&err) => {
                let delay = backoff.next_delay();
                tracing::debug!("transient accept error, retrying in {delay:?}: {err}");
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

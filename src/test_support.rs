//! Channel-backed codec doubles shared by the module tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use crate::codec::Codec;
use crate::error::CodecError;

/// In-memory codec: `receive` reads what the endpoint feeds, `send` writes
/// into the endpoint's sink. `close` unblocks a pending `receive`.
pub(crate) struct TestCodec {
    inbound: Receiver<String>,
    outbound: Sender<String>,
    closed_rx: Receiver<()>,
    closed_tx: Mutex<Option<Sender<()>>>,
    knobs: Arc<Knobs>,
}

struct Knobs {
    close_count: AtomicUsize,
    fail_sends: AtomicBool,
    send_delay: Mutex<Duration>,
}

/// The far side of a [`TestCodec`], plus its behavior knobs.
pub(crate) struct TestEndpoint {
    pub(crate) feed: Sender<String>,
    pub(crate) sent: Receiver<String>,
    knobs: Arc<Knobs>,
}

impl TestEndpoint {
    pub(crate) fn close_count(&self) -> usize {
        self.knobs.close_count.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sends(&self) {
        self.knobs.fail_sends.store(true, Ordering::SeqCst);
    }

    pub(crate) fn delay_sends(&self, delay: Duration) {
        *self.knobs.send_delay.lock().unwrap() = delay;
    }
}

pub(crate) fn test_codec() -> (TestCodec, TestEndpoint) {
    let (feed, inbound) = unbounded();
    let (outbound, sent) = unbounded();
    let (closed_tx, closed_rx) = bounded(0);
    let knobs = Arc::new(Knobs {
        close_count: AtomicUsize::new(0),
        fail_sends: AtomicBool::new(false),
        send_delay: Mutex::new(Duration::ZERO),
    });
    (
        TestCodec {
            inbound,
            outbound,
            closed_rx,
            closed_tx: Mutex::new(Some(closed_tx)),
            knobs: Arc::clone(&knobs),
        },
        TestEndpoint { feed, sent, knobs },
    )
}

fn stream_closed() -> CodecError {
    CodecError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "test stream closed",
    ))
}

impl Codec for TestCodec {
    type Msg = String;

    fn receive(&self) -> Result<String, CodecError> {
        crossbeam::select! {
            recv(self.inbound) -> msg => msg.map_err(|_| stream_closed()),
            recv(self.closed_rx) -> _ => Err(stream_closed()),
        }
    }

    fn send(&self, msg: String) -> Result<(), CodecError> {
        let delay = *self.knobs.send_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.knobs.fail_sends.load(Ordering::SeqCst) {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "test send failure",
            )));
        }
        self.outbound.send(msg).map_err(|_| stream_closed())
    }

    fn close(&self) -> Result<(), CodecError> {
        self.knobs.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed_tx.lock().unwrap().take();
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

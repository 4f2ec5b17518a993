//! Per-connection session lifecycle, send queue, and close callbacks.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};

use crate::codec::Codec;
use crate::error::SessionError;
use crate::manager::Manager;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Ids are process-wide, start at 1, and are never reused.
fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// A live, bidirectional message endpoint over one stream.
///
/// Constructed with `send_queue_size == 0` the session sends synchronously:
/// [`send`](Session::send) writes through the codec under an exclusive lock.
/// With a positive size it owns a bounded send queue and a send-loop thread;
/// [`send`](Session::send) then enqueues without blocking and a full queue
/// closes the session rather than stalling the producer.
///
/// All methods take `&self`; sessions are shared as `Arc<Session<C>>`.
pub struct Session<C: Codec> {
    id: u64,
    codec: C,
    manager: Option<Weak<Manager<C>>>,

    /// Write-locked for sync sends and for closing the queue; read-locked
    /// for async enqueues. `None` in sync mode and after close.
    send_tx: RwLock<Option<Sender<C::Msg>>>,
    /// Present iff the session was built with a send queue.
    send_rx: Option<Receiver<C::Msg>>,

    recv_lock: Mutex<()>,

    closed: AtomicBool,
    /// Dropped on close; every cloned receiver observes the disconnect.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    callbacks: Mutex<Vec<CloseCallback>>,

    state: StateSlot,
}

struct CloseCallback {
    handler: u64,
    key: Box<dyn Any + Send>,
    func: Box<dyn FnOnce() + Send>,
}

impl<C: Codec> Session<C> {
    /// Creates a standalone session not bound to any manager; the caller
    /// owns its lifetime.
    pub fn new(codec: C, send_queue_size: usize) -> Arc<Self> {
        Self::spawn(None, codec, send_queue_size)
    }

    pub(crate) fn spawn(
        manager: Option<Weak<Manager<C>>>,
        codec: C,
        send_queue_size: usize,
    ) -> Arc<Self> {
        let (close_tx, close_rx) = bounded(0);
        let (send_tx, send_rx) = if send_queue_size > 0 {
            let (tx, rx) = bounded(send_queue_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = Arc::new(Self {
            id: next_session_id(),
            codec,
            manager,
            send_tx: RwLock::new(send_tx),
            send_rx: send_rx.clone(),
            recv_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            callbacks: Mutex::new(Vec::new()),
            state: StateSlot::new(),
        });

        if let Some(queue) = send_rx {
            let worker = Arc::clone(&session);
            thread::spawn(move || send_loop(worker, queue));
        }
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opaque user state attached to this session.
    pub fn state(&self) -> &StateSlot {
        &self.state
    }

    /// Blocks until the codec yields one message. Receives are serialized:
    /// at most one thread is inside the codec's receive at any time. A
    /// codec error closes the session and is returned unchanged.
    pub fn receive(&self) -> Result<C::Msg, SessionError> {
        let _guard = self
            .recv_lock
            .lock()
            .expect("session receive lock poisoned");
        match self.codec.receive() {
            Ok(msg) => Ok(msg),
            Err(err) => {
                let _ = self.close();
                Err(SessionError::Codec(err))
            }
        }
    }

    /// Sends one message.
    ///
    /// Sync mode writes through the codec under the exclusive send lock, so
    /// a slow codec serializes senders. Async mode enqueues without
    /// blocking; a full queue closes the session and returns
    /// [`SessionError::Blocked`].
    pub fn send(&self, msg: C::Msg) -> Result<(), SessionError> {
        if self.send_rx.is_none() {
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            let _guard = self.send_tx.write().expect("session send lock poisoned");
            return match self.codec.send(msg) {
                Ok(()) => Ok(()),
                Err(err) => {
                    let _ = self.close();
                    Err(SessionError::Codec(err))
                }
            };
        }

        let guard = self.send_tx.read().expect("session send lock poisoned");
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let Some(tx) = guard.as_ref() else {
            return Err(SessionError::Closed);
        };
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                drop(guard);
                let _ = self.close();
                Err(SessionError::Blocked)
            }
            Err(TrySendError::Disconnected(_)) => Err(SessionError::Closed),
        }
    }

    /// The single idempotent close transition.
    ///
    /// Exactly one caller wins the closed-flag swap; it signals waiters,
    /// closes the send queue (handing residual messages to the codec's
    /// drain capability if present), closes the codec, and returns the
    /// codec's close outcome. Every later call returns
    /// [`SessionError::Closed`].
    ///
    /// Close callbacks run on a fresh thread, in registration order, after
    /// the codec is closed; manager deregistration follows them. Running
    /// them outside the send/close locks lets callbacks re-enter channel
    /// and manager operations without deadlocking.
    pub fn close(&self) -> Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Closed);
        }

        self.close_tx
            .lock()
            .expect("session close signal lock poisoned")
            .take();

        if let Some(queue) = &self.send_rx {
            let mut tx = self.send_tx.write().expect("session send lock poisoned");
            tx.take();
            if let Some(drain) = self.codec.as_drain() {
                drain.drain_send_queue(queue.clone());
            }
        }

        let result = self.codec.close();

        let callbacks = std::mem::take(
            &mut *self
                .callbacks
                .lock()
                .expect("session callbacks lock poisoned"),
        );
        let manager = self.manager.clone();
        let id = self.id;
        thread::spawn(move || {
            for callback in callbacks {
                (callback.func)();
            }
            if let Some(manager) = manager.and_then(|weak| weak.upgrade()) {
                manager.del_session(id);
            }
        });

        result.map_err(SessionError::Codec)
    }

    /// Registers a close callback tagged `(handler, key)`. Callbacks fire
    /// exactly once, in registration order. No-op on a closed session.
    pub fn add_close_callback<K, F>(&self, handler: u64, key: K, func: F)
    where
        K: Any + Send,
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let mut callbacks = self
            .callbacks
            .lock()
            .expect("session callbacks lock poisoned");
        callbacks.push(CloseCallback {
            handler,
            key: Box::new(key),
            func: Box::new(func),
        });
    }

    /// Unregisters the first callback whose `(handler, key)` matches.
    /// Later duplicates are left in place. No-op on a closed session.
    pub fn remove_close_callback<K>(&self, handler: u64, key: &K)
    where
        K: Any + PartialEq,
    {
        if self.is_closed() {
            return;
        }
        let mut callbacks = self
            .callbacks
            .lock()
            .expect("session callbacks lock poisoned");
        if let Some(pos) = callbacks.iter().position(|cb| {
            cb.handler == handler && cb.key.downcast_ref::<K>().is_some_and(|k| k == key)
        }) {
            callbacks.remove(pos);
        }
    }
}

fn send_loop<C: Codec>(session: Arc<Session<C>>, queue: Receiver<C::Msg>) {
    let close_rx = session.close_rx.clone();
    loop {
        crossbeam::select! {
            recv(queue) -> msg => {
                let Ok(msg) = msg else { break };
                if session.codec.send(msg).is_err() {
                    break;
                }
            }
            recv(close_rx) -> _ => break,
        }
    }
    let _ = session.close();
}

/// Type-erased user state holder carried by sessions and channels.
pub struct StateSlot {
    slot: Mutex<Option<Box<dyn Any + Send>>>,
}

impl StateSlot {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn set<T: Any + Send>(&self, value: T) {
        *self.slot.lock().expect("state lock poisoned") = Some(Box::new(value));
    }

    /// Removes and returns the state if it holds a `T`; a mismatched type
    /// is left in place.
    pub fn take<T: Any + Send>(&self) -> Option<Box<T>> {
        let mut slot = self.slot.lock().expect("state lock poisoned");
        match slot.take()?.downcast::<T>() {
            Ok(value) => Some(value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    pub fn with<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut slot = self.slot.lock().expect("state lock poisoned");
        f(slot.as_mut().and_then(|value| value.downcast_mut::<T>()))
    }
}

//! TCP server frame: accept loop, codec construction, handler dispatch.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::codec::{Codec, Protocol};
use crate::manager::Manager;
use crate::net::{self, Backoff, BackoffPolicy};
use crate::session::Session;

/// Per-connection entry point. Invoked once per accepted connection on a
/// dedicated thread. The handler owns the session's receive loop; the
/// framework never receives on its behalf.
pub trait Handler<C: Codec>: Send + Sync + 'static {
    fn handle_session(&self, session: Arc<Session<C>>);
}

/// Adapts a plain closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

impl<C, F> Handler<C> for HandlerFn<F>
where
    C: Codec,
    F: Fn(Arc<Session<C>>) + Send + Sync + 'static,
{
    fn handle_session(&self, session: Arc<Session<C>>) {
        (self.0)(session)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// Send queue capacity for accepted sessions; 0 means synchronous
    /// sends.
    pub send_queue_size: usize,
    pub accept_backoff: BackoffPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 0,
            accept_backoff: BackoffPolicy::default(),
        }
    }
}

/// Accept loop plus the manager owning every accepted session.
pub struct Server<P: Protocol<TcpStream>> {
    listener: TcpListener,
    protocol: Arc<P>,
    manager: Arc<Manager<P::Codec>>,
    handler: Arc<dyn Handler<P::Codec>>,
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
}

/// Binds `addr` and builds a server around the resulting listener.
pub fn listen<A, P, H>(
    addr: A,
    protocol: P,
    handler: H,
    config: ServerConfig,
) -> io::Result<Server<P>>
where
    A: ToSocketAddrs,
    P: Protocol<TcpStream>,
    H: Handler<P::Codec>,
{
    let listener = TcpListener::bind(addr)?;
    Server::new(listener, protocol, handler, config)
}

impl<P: Protocol<TcpStream>> Server<P> {
    pub fn new<H>(
        listener: TcpListener,
        protocol: P,
        handler: H,
        config: ServerConfig,
    ) -> io::Result<Self>
    where
        H: Handler<P::Codec>,
    {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            protocol: Arc::new(protocol),
            manager: Manager::new(),
            handler: Arc::new(handler),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn manager(&self) -> &Arc<Manager<P::Codec>> {
        &self.manager
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session<P::Codec>>> {
        self.manager.session(id)
    }

    /// Runs the accept loop until [`stop`](Server::stop) or a
    /// non-transient listener error. Each accepted connection gets its own
    /// thread: codec construction (failure drops the connection), manager
    /// registration, then the handler.
    pub fn serve(&self) -> io::Result<()> {
        let mut backoff = Backoff::new(self.config.accept_backoff);
        loop {
            let Some(stream) = net::accept(&self.listener, &self.shutdown, &mut backoff)? else {
                return Ok(());
            };

            let protocol = Arc::clone(&self.protocol);
            let manager = Arc::clone(&self.manager);
            let handler = Arc::clone(&self.handler);
            let send_queue_size = self.config.send_queue_size;
            thread::spawn(move || {
                // Some platforms hand out accepted sockets inheriting the
                // listener's nonblocking mode.
                if let Err(err) = stream.set_nonblocking(false) {
                    tracing::warn!("failed to configure accepted connection: {err}");
                    return;
                }
                let codec = match protocol.new_codec(stream) {
                    Ok(codec) => codec,
                    Err(err) => {
                        tracing::warn!("codec construction failed: {err}");
                        return;
                    }
                };
                let session = manager.new_session(codec, send_queue_size);
                handler.handle_session(session);
            });
        }
    }

    /// Ends the accept loop and disposes the manager; returns only after
    /// every registered session's delete hook has fired.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.manager.dispose();
    }
}

//! Sharded session registry and graceful-shutdown barrier.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Once, RwLock};

use crate::codec::Codec;
use crate::session::Session;

const SHARD_COUNT: u64 = 32;

/// Registry of live sessions owned by a server.
///
/// Sessions are partitioned into [`SHARD_COUNT`] independently locked
/// shards by `id % SHARD_COUNT`, so lookups and registration contend only
/// within a shard. [`dispose`](Manager::dispose) is the graceful-shutdown
/// barrier: it closes every registered session and returns only after each
/// one's delete hook has fired.
pub struct Manager<C: Codec> {
    shards: [RwLock<Shard<C>>; SHARD_COUNT as usize],
    dispose_once: Once,
    live: WaitCounter,
}

struct Shard<C: Codec> {
    sessions: HashMap<u64, Arc<Session<C>>>,
    disposed: bool,
}

impl<C: Codec> Default for Shard<C> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            disposed: false,
        }
    }
}

impl<C: Codec> Manager<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shards: std::array::from_fn(|_| RwLock::new(Shard::default())),
            dispose_once: Once::new(),
            live: WaitCounter::new(),
        })
    }

    /// Creates a session bound to this manager and registers it. If the
    /// manager is already disposed the session is returned already closed.
    pub fn new_session(self: &Arc<Self>, codec: C, send_queue_size: usize) -> Arc<Session<C>> {
        let session = Session::spawn(Some(Arc::downgrade(self)), codec, send_queue_size);
        self.put_session(Arc::clone(&session));
        session
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session<C>>> {
        let shard = self.shard(id).read().expect("manager shard lock poisoned");
        shard.sessions.get(&id).cloned()
    }

    /// Closes every registered session and blocks until all of their
    /// delete hooks have fired. Subsequent registrations are closed on
    /// arrival. Idempotent; concurrent callers block until the first
    /// completes.
    pub fn dispose(&self) {
        self.dispose_once.call_once(|| {
            for shard in &self.shards {
                let mut shard = shard.write().expect("manager shard lock poisoned");
                shard.disposed = true;
                for session in shard.sessions.values() {
                    let _ = session.close();
                }
            }
            self.live.wait_zero();
        });
    }

    fn put_session(&self, session: Arc<Session<C>>) {
        let mut shard = self
            .shard(session.id())
            .write()
            .expect("manager shard lock poisoned");
        if shard.disposed {
            let _ = session.close();
            return;
        }
        shard.sessions.insert(session.id(), session);
        self.live.add();
    }

    /// Invoked from the session's close-callback path.
    pub(crate) fn del_session(&self, id: u64) {
        let mut shard = self.shard(id).write().expect("manager shard lock poisoned");
        if shard.sessions.remove(&id).is_some() {
            self.live.done();
        }
    }

    fn shard(&self, id: u64) -> &RwLock<Shard<C>> {
        &self.shards[(id % SHARD_COUNT) as usize]
    }
}

/// Wait-for-zero counter: `add` per registration, `done` per delete hook,
/// `wait_zero` blocks until they balance.
struct WaitCounter {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitCounter {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    fn add(&self) {
        *self.count.lock().expect("wait counter lock poisoned") += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().expect("wait counter lock poisoned");
        debug_assert!(*count > 0, "wait counter underflow");
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    fn wait_zero(&self) {
        let mut count = self.count.lock().expect("wait counter lock poisoned");
        while *count > 0 {
            count = self.zero.wait(count).expect("wait counter lock poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::test_support::{test_codec, wait_until};

    #[test]
    fn registered_sessions_are_found_by_id() {
        let manager = Manager::new();
        let (codec, _peer) = test_codec();
        let session = manager.new_session(codec, 0);

        let found = manager.session(session.id()).expect("session registered");
        assert_eq!(found.id(), session.id());
        assert!(manager.session(session.id() + 1_000_000).is_none());

        manager.dispose();
    }

    #[test]
    fn closing_a_session_removes_it_from_the_manager() {
        let manager = Manager::new();
        let (codec, _peer) = test_codec();
        let session = manager.new_session(codec, 0);
        let id = session.id();

        session.close().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            manager.session(id).is_none()
        }));
    }

    #[test]
    fn dispose_closes_all_sessions_and_waits_for_delete_hooks() {
        let manager = Manager::new();
        let mut sessions = Vec::new();
        for _ in 0..64 {
            let (codec, _peer) = test_codec();
            sessions.push(manager.new_session(codec, 0));
        }

        manager.dispose();

        for session in &sessions {
            assert!(session.is_closed());
            assert!(manager.session(session.id()).is_none());
        }
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_concurrent_callers() {
        let manager = Manager::new();
        let (codec, _peer) = test_codec();
        let session = manager.new_session(codec, 0);

        let concurrent = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.dispose())
        };
        manager.dispose();
        concurrent.join().expect("dispose thread panicked");

        assert!(session.is_closed());
        manager.dispose();
    }

    #[test]
    fn sessions_registered_after_dispose_come_back_closed() {
        let manager = Manager::new();
        manager.dispose();

        let (codec, peer) = test_codec();
        let session = manager.new_session(codec, 0);
        assert!(session.is_closed());
        assert_eq!(peer.close_count(), 1);
        assert!(manager.session(session.id()).is_none());

        // The rejected registration must not wedge a later dispose cycle.
        manager.dispose();
    }

    #[test]
    fn registrations_racing_dispose_all_end_closed() {
        let manager = Manager::new();
        let threads = 8;
        let per_thread = 50;

        let spawners: Vec<_> = (0..threads)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let mut created = Vec::new();
                    for _ in 0..per_thread {
                        let (codec, _peer) = test_codec();
                        created.push(manager.new_session(codec, 0));
                    }
                    created
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(5));
        let started = Instant::now();
        manager.dispose();
        assert!(started.elapsed() < Duration::from_secs(10));

        for spawner in spawners {
            for session in spawner.join().expect("spawner panicked") {
                assert!(wait_until(Duration::from_secs(2), || session.is_closed()));
                assert!(wait_until(Duration::from_secs(2), || {
                    manager.session(session.id()).is_none()
                }));
            }
        }
    }
}

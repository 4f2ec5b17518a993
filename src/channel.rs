//! Keyed session groups with auto-eviction on session close.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::codec::Codec;
use crate::session::{Session, StateSlot};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(0);

/// A user-keyed collection of sessions (a room, a topic, a player group).
///
/// Each member carries one close callback registered by this channel,
/// tagged with the channel's id and the member's key; when the session
/// closes, the entry is removed automatically. The callback runs on the
/// session's close-dispatch thread, so a closed session may remain visible
/// through [`get`](Channel::get) for a short window; callers must tolerate
/// that.
///
/// A channel never closes its members: session lifetime stays with the
/// manager or the handler that owns it.
pub struct Channel<K, C: Codec> {
    id: u64,
    sessions: RwLock<HashMap<K, Arc<Session<C>>>>,
    state: StateSlot,
}

impl<K, C> Channel<K, C>
where
    K: Eq + Hash + Clone + Any + Send + Sync,
    C: Codec,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed) + 1,
            sessions: RwLock::new(HashMap::new()),
            state: StateSlot::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("channel lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opaque user state attached to this channel.
    pub fn state(&self) -> &StateSlot {
        &self.state
    }

    pub fn get(&self, key: &K) -> Option<Arc<Session<C>>> {
        self.sessions
            .read()
            .expect("channel lock poisoned")
            .get(key)
            .cloned()
    }

    /// Inserts `session` under `key`. An existing member under the same key
    /// is evicted first, with its callback deregistered, so closing the old
    /// session can no longer disturb the new entry.
    pub fn put(self: &Arc<Self>, key: K, session: Arc<Session<C>>) {
        let mut sessions = self.sessions.write().expect("channel lock poisoned");
        let _ = evict(&mut sessions, self.id, &key);

        let channel = Arc::downgrade(self);
        let eviction_key = key.clone();
        session.add_close_callback(self.id, key.clone(), move || {
            if let Some(channel) = channel.upgrade() {
                channel.remove(&eviction_key);
            }
        });
        sessions.insert(key, session);
    }

    /// Removes the entry under `key`, deregistering its close callback.
    /// Returns whether an entry was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut sessions = self.sessions.write().expect("channel lock poisoned");
        evict(&mut sessions, self.id, key).is_some()
    }

    /// Visits every member under the read lock, in unspecified order. The
    /// callback must not call back into this channel or it will deadlock.
    pub fn fetch(&self, mut callback: impl FnMut(&Arc<Session<C>>)) {
        let sessions = self.sessions.read().expect("channel lock poisoned");
        for session in sessions.values() {
            callback(session);
        }
    }

    /// Detaches every member, deregistering callbacks, and hands each
    /// removed session to `callback`. Used for broadcast-then-clear.
    pub fn fetch_and_remove(&self, mut callback: impl FnMut(Arc<Session<C>>)) {
        let mut sessions = self.sessions.write().expect("channel lock poisoned");
        for (key, session) in sessions.drain() {
            session.remove_close_callback(self.id, &key);
            callback(session);
        }
    }

    /// Removes every entry, deregistering callbacks. Member sessions stay
    /// open.
    pub fn close(&self) {
        let mut sessions = self.sessions.write().expect("channel lock poisoned");
        for (key, session) in sessions.drain() {
            session.remove_close_callback(self.id, &key);
        }
    }
}

fn evict<K, C>(
    sessions: &mut HashMap<K, Arc<Session<C>>>,
    channel_id: u64,
    key: &K,
) -> Option<Arc<Session<C>>>
where
    K: Eq + Hash + Any,
    C: Codec,
{
    let session = sessions.remove(key)?;
    session.remove_close_callback(channel_id, key);
    Some(session)
}

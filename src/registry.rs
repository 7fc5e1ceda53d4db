use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// In-memory map whose entries disappear `ttl` after their last write.
pub struct TtlRegistry<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlRegistry<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .write()
            .insert(key, Entry { value, expires_at });
    }

    /// Inserts unless a live entry exists. Returns whether `value` was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(&key).is_some_and(|e| e.expires_at > now) {
            return false;
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Changes a live entry in place and refreshes its expiry.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                f(&mut entry.value);
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|e| e.value)
    }

    /// Drops expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> TtlRegistry<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = registry.sweep();
                        if removed > 0 {
                            log::debug!("Swept {removed} expired registry entries");
                        }
                    }
                }
            }
        })
    }
}

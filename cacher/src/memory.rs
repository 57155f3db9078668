use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{CacheBackend, CacheError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Recent,
    Frequent,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires: Option<Instant>,
    queue: Queue,
    tick: u64,
}

/// Two-queue LRU: new keys enter `recent`; keys seen again move to
/// `frequent`. Keys evicted from `recent` are remembered as ghosts so a
/// quick return goes straight to `frequent`.
#[derive(Debug)]
struct TwoQueue {
    capacity: usize,
    recent_target: usize,
    ghost_capacity: usize,
    entries: HashMap<String, Entry>,
    recent: BTreeMap<u64, String>,
    frequent: BTreeMap<u64, String>,
    ghosts: VecDeque<String>,
    ghost_set: HashSet<String>,
    clock: u64,
}

impl TwoQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            recent_target: (capacity / 4).max(1),
            ghost_capacity: (capacity / 2).max(1),
            entries: HashMap::new(),
            recent: BTreeMap::new(),
            frequent: BTreeMap::new(),
            ghosts: VecDeque::new(),
            ghost_set: HashSet::new(),
            clock: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn unlink(&mut self, queue: Queue, tick: u64) {
        match queue {
            Queue::Recent => self.recent.remove(&tick),
            Queue::Frequent => self.frequent.remove(&tick),
        };
    }

    fn promote(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            let (queue, old) = (entry.queue, entry.tick);
            entry.queue = Queue::Frequent;
            entry.tick = tick;
            self.unlink(queue, old);
            self.frequent.insert(tick, key.to_owned());
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires.is_some_and(|at| at <= Instant::now()),
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.promote(key);
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            entry.expires = expires;
            self.promote(key);
            return;
        }

        let ghost = self.ghost_set.remove(key);
        if ghost {
            self.ghosts.retain(|k| k != key);
        }
        self.make_room(ghost);

        let tick = self.next_tick();
        let queue = if ghost { Queue::Frequent } else { Queue::Recent };
        match queue {
            Queue::Recent => self.recent.insert(tick, key.to_owned()),
            Queue::Frequent => self.frequent.insert(tick, key.to_owned()),
        };
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires,
                queue,
                tick,
            },
        );
    }

    fn make_room(&mut self, ghost_hit: bool) {
        if self.entries.len() < self.capacity {
            return;
        }
        let recent = self.recent.len();
        if recent > 0 && (recent > self.recent_target || (recent == self.recent_target && !ghost_hit))
        {
            if let Some((_, key)) = self.recent.pop_first() {
                self.entries.remove(&key);
                self.remember(key);
            }
        } else if let Some((_, key)) = self.frequent.pop_first() {
            self.entries.remove(&key);
        } else if let Some((_, key)) = self.recent.pop_first() {
            self.entries.remove(&key);
            self.remember(key);
        }
    }

    fn remember(&mut self, key: String) {
        if self.ghosts.len() >= self.ghost_capacity {
            if let Some(old) = self.ghosts.pop_front() {
                self.ghost_set.remove(&old);
            }
        }
        self.ghost_set.insert(key.clone());
        self.ghosts.push_back(key);
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.unlink(entry.queue, entry.tick);
        }
    }
}

/// A bounded in-process cache with two-queue LRU eviction.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<TwoQueue>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MEMORY_ENTRIES)
    }
}

impl MemoryCache {
    /// A cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TwoQueue::new(capacity)),
        }
    }

    /// Number of live and not yet reaped entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.inner.lock().get(key))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.inner.lock().insert(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.inner.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequently_used_keys_survive_scans() {
        let mut q = TwoQueue::new(4);
        q.insert("hot", b"h".to_vec(), None);
        assert!(q.get("hot").is_some());

        for i in 0..10 {
            q.insert(&format!("scan-{i}"), vec![i], None);
        }
        assert!(q.get("hot").is_some());
        assert!(q.entries.len() <= 4);
        assert!(q.get("scan-0").is_none());
    }

    #[test]
    fn ghost_hit_goes_to_frequent() {
        let mut q = TwoQueue::new(4);
        for i in 0..5 {
            q.insert(&format!("k{i}"), vec![i], None);
        }
        assert!(!q.entries.contains_key("k0"));
        assert!(q.ghost_set.contains("k0"));

        q.insert("k0", vec![0], None);
        assert_eq!(q.entries["k0"].queue, Queue::Frequent);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = MemoryCache::new(8);
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }
}

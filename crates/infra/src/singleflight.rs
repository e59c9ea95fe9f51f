//! Per-key serialization of concurrent work.
//!
//! Callers with the same key run one at a time; the first to get the lock
//! does the work, later ones re-check whatever the first one produced (for
//! submissions: the job it inserted) instead of repeating it. Keys are
//! dropped from the map once nobody holds or waits on them.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;

type FlightMap<K> = StdMutex<HashMap<K, Arc<Mutex<()>>>>;

#[derive(Debug)]
pub struct Singleflight<K> {
    inflight: FlightMap<K>,
}

impl<K> Default for Singleflight<K> {
    fn default() -> Self {
        Self {
            inflight: StdMutex::new(HashMap::new()),
        }
    }
}

impl<K> Singleflight<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` while holding the lock for `key`.
    ///
    /// The key is released even if the returned future is dropped before it
    /// resolves.
    pub async fn run<F, Fut, T>(&self, key: K, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let flight = Flight::join(&self.inflight, key);
        let _held = flight.lock.lock().await;
        work().await
    }

    /// Keys currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One caller's stake in a key; leaving drops the key once nobody else has one.
struct Flight<'a, K: Eq + Hash> {
    map: &'a FlightMap<K>,
    key: K,
    lock: Arc<Mutex<()>>,
}

impl<'a, K> Flight<'a, K>
where
    K: Eq + Hash + Clone,
{
    fn join(map: &'a FlightMap<K>, key: K) -> Self {
        let lock = {
            let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        Self { map, key, lock }
    }
}

impl<K: Eq + Hash> Drop for Flight<'_, K> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this flight hold the lock: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

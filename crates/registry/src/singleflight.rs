//! Keyed coalescing of duplicate concurrent operations.
//!
//! Concurrent callers presenting the same key share one execution: the first
//! caller becomes the leader and runs the operation, later callers wait on
//! the leader's completion signal and receive a clone of the result. Used by
//! the cache refresh paths (keyed by cache name) and by service
//! auto-creation (keyed by `namespace:name`).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

pub struct SingleFlight<K, V> {
    pending: Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the pending entry even when the leader future is cancelled, so
/// waiters can re-elect instead of hanging on a dead channel.
struct LeaderGuard<K: Eq + Hash + Clone, V> {
    key: K,
    pending: Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>,
}

impl<K: Eq + Hash + Clone, V> Drop for LeaderGuard<K, V> {
    fn drop(&mut self) {
        let mut map = self.pending.lock().expect("singleflight map poisoned");
        map.remove(&self.key);
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `make()` for this key unless another caller is already running
    /// it, in which case the shared result is awaited instead.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let mut make = Some(make);
        loop {
            enum Role<V> {
                Leader(watch::Sender<Option<V>>),
                Waiter(watch::Receiver<Option<V>>),
            }

            let role = {
                let mut map = self.pending.lock().expect("singleflight map poisoned");
                if let Some(rx) = map.get(&key) {
                    Role::Waiter(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = LeaderGuard {
                        key: key.clone(),
                        pending: Arc::clone(&self.pending),
                    };
                    let make = make.take().expect("leader elected twice");
                    let value = make().await;
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Role::Waiter(mut rx) => {
                    loop {
                        if let Some(value) = rx.borrow().clone() {
                            return value;
                        }
                        if rx.changed().await.is_err() {
                            // Leader was cancelled before producing a value;
                            // loop around and contend for leadership again.
                            break;
                        }
                    }
                    if make.is_none() {
                        // Only possible when this caller already led once,
                        // which cannot happen: leaders return above.
                        unreachable!("singleflight waiter lost its closure");
                    }
                }
            }
        }
    }
}

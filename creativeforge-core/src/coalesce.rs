//! At-most-one-in-flight request coalescing.
//!
//! Callers asking for the same key while a computation is running await the
//! same shared future instead of starting their own. The registry only holds
//! weak handles: when every caller goes away the computation is dropped, and
//! the next caller starts a fresh one.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

type Inflight<V> = Shared<BoxFuture<'static, V>>;

pub struct Coalescer<K, V>
where
    V: Clone,
{
    inflight: Mutex<HashMap<K, WeakShared<BoxFuture<'static, V>>>>,
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    /// Join the in-flight computation for `key`, or start one with `start`.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let _registration = Registration { coalescer: self, key: key.clone() };
        let shared = self.join_or_start(&key, start);
        // The awaited handle must drop before the registration prunes.
        let out = shared.await;
        out
    }

    fn join_or_start<F, Fut>(&self, key: &K, start: F) -> Inflight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(key).and_then(WeakShared::upgrade) {
            tracing::debug!(?key, "joining in-flight computation");
            return existing;
        }
        inflight.retain(|_, weak| weak.upgrade().is_some());
        let fut = start().boxed().shared();
        if let Some(weak) = fut.downgrade() {
            inflight.insert(key.clone(), weak);
        }
        fut
    }

    /// Drop the entry for `key` once nobody awaits it or it has produced a value.
    fn prune(&self, key: &K) {
        let mut inflight = self.inflight.lock();
        let settled = match inflight.get(key).map(WeakShared::upgrade) {
            Some(Some(current)) => current.peek().is_some(),
            Some(None) => true,
            None => false,
        };
        if settled {
            inflight.remove(key);
        }
    }

    /// Keys with a registered computation.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prunes the caller's key when `run` finishes or is cancelled.
struct Registration<'a, K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone + Send + Sync + 'static,
{
    coalescer: &'a Coalescer<K, V>,
    key: K,
}

impl<K, V> Drop for Registration<'_, K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.coalescer.prune(&self.key);
    }
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

//! Keyed cancellation of listeners.
//!
//! A view registers what it is waiting on under a key; tearing the view down cancels the key.
//! Cancelling aborts the *listener* future only. Wrap a [`FetchHandle`](crate::FetchHandle) (or
//! anything else that merely observes shared work) and the underlying load keeps running and still
//! updates the cache and store. Registering a key again cancels the previous listener under it.

use futures::future::{AbortHandle, Abortable};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener was cancelled")]
pub struct Cancelled;

type Listeners = HashMap<String, (u64, AbortHandle)>;

#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    listeners: Arc<Mutex<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` under `key`. The returned future resolves to the listener's output, or
    /// [`Cancelled`] if the key is cancelled or re-registered first.
    pub fn listen<F>(
        &self,
        key: impl Into<String>,
        listener: F,
    ) -> impl Future<Output = Result<F::Output, Cancelled>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send,
    {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, registration) = AbortHandle::new_pair();
        if let Some((_, previous)) = self.listeners().insert(key.clone(), (id, handle)) {
            tracing::trace!(key = %key, "replacing listener");
            previous.abort();
        }

        let release = Release { registry: self.clone(), key, id };
        async move {
            let _release = release;
            Abortable::new(listener, registration).await.map_err(|_| Cancelled)
        }
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.listeners().remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.listeners().drain().collect();
        for (_, (_, handle)) in drained {
            handle.abort();
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.listeners().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.listeners().len()
    }
}

/// Unregisters a listener when it completes or is dropped, unless a newer one took its key.
struct Release {
    registry: CancellationRegistry,
    key: String,
    id: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        let mut listeners = self.registry.listeners();
        if listeners.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            listeners.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn completed_listener_unregisters() {
        let reg = CancellationRegistry::new();
        let out = reg.listen("clients", async { 5 }).await;
        assert_eq!(out, Ok(5));
        assert!(!reg.is_active("clients"));
    }

    #[tokio::test]
    async fn cancel_detaches_listener_but_not_the_work() {
        let reg = CancellationRegistry::new();
        let (tx, rx) = oneshot::channel::<u32>();
        let gate = Arc::new(tokio::sync::Notify::new());
        let work = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.notified().await;
                let _ = tx.send(9);
                "finished"
            }
        });

        let listener = tokio::spawn(reg.listen("pet:4", rx));
        tokio::task::yield_now().await;
        assert!(reg.cancel("pet:4"));
        gate.notify_one();
        assert_eq!(listener.await.unwrap(), Err(Cancelled));
        assert_eq!(work.await.unwrap(), "finished");
        assert!(!reg.is_active("pet:4"));
    }

    #[tokio::test]
    async fn reregistering_cancels_previous_listener() {
        let reg = CancellationRegistry::new();
        let first = reg.listen("search", futures::future::pending::<()>());
        let second = reg.listen("search", async { "latest" });
        assert_eq!(first.await, Err(Cancelled));
        assert_eq!(second.await, Ok("latest"));
        assert_eq!(reg.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_and_drop_cleanup() {
        let reg = CancellationRegistry::new();
        let a = reg.listen("a", futures::future::pending::<()>());
        let b = reg.listen("b", futures::future::pending::<()>());
        assert_eq!(reg.active_count(), 2);
        drop(b);
        assert!(!reg.is_active("b"));
        reg.cancel_all();
        assert_eq!(a.await, Err(Cancelled));
    }
}

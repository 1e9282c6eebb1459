//! Observable, cached state for one resource collection.
//!
//! A [`ResourceStore`] pairs a [`TtlCache`] with a `watch`ed [`StoreState`] and the shared
//! [`LoadingRegistry`]. A fetch that hits the cache touches neither the state nor the registry.
//! A fetch that loads marks `"{store}:{key}"` in the registry for its duration, flags the state
//! as loading, and finally records the data or the error.

use crate::cache::{CachePolicy, TtlCache};
use crate::clock::Clock;
use crate::loading::LoadingRegistry;
use crate::{ApiError, ErrorKind};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

/// Snapshot observed by views.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    /// Epoch milliseconds of the last successful load.
    pub last_updated: Option<u64>,
}

impl<T> Default for StoreState<T> {
    fn default() -> Self {
        Self { data: None, loading: false, error: None, last_updated: None }
    }
}

/// What a mutation makes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidate {
    Key(String),
    Prefix(String),
    All,
}

struct StoreInner<T> {
    name: String,
    cache: TtlCache<T>,
    state: watch::Sender<StoreState<T>>,
    loading: LoadingRegistry,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    pending: AtomicUsize,
}

/// Cheap to clone; clones share cache and state.
pub struct ResourceStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for ResourceStore<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for ResourceStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

impl<T> ResourceStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        policy: CachePolicy,
        loading: LoadingRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _rx) = watch::channel(StoreState::default());
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                cache: TtlCache::new(Arc::clone(&clock)),
                state,
                loading,
                clock,
                policy,
                pending: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Registry key used while `key` loads.
    pub fn loading_key(&self, key: &str) -> String {
        format!("{}:{key}", self.inner.name)
    }

    pub fn cache(&self) -> &TtlCache<T> {
        &self.inner.cache
    }

    /// Fetch `key` under the store's default policy.
    pub async fn fetch<F, Fut>(&self, key: &str, loader: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.fetch_with(key, self.inner.policy, loader).await
    }

    pub async fn fetch_with<F, Fut>(&self, key: &str, policy: CachePolicy, loader: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let inner = &self.inner;
        let loading_key = self.loading_key(key);
        inner
            .cache
            .fetch(key, policy, move || async move {
                let _loading = inner.loading.guard(loading_key);
                let _pending = Pending::enter(inner);
                let result = loader().await;
                match &result {
                    Ok(data) => inner.set_data(data.clone()),
                    Err(err) => inner.set_error(err),
                }
                result
            })
            .await
    }

    /// Fetch on a background task. The handle only listens: dropping it leaves the load running,
    /// and its result still lands in the cache and the state.
    pub fn spawn_fetch<F, Fut>(&self, key: impl Into<String>, loader: F) -> FetchHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        let key = key.into();
        tokio::spawn(async move {
            let result = store.fetch(&key, loader).await;
            let _ = tx.send(result);
        });
        FetchHandle { rx }
    }

    /// Run a create/update/delete. The listed entries are invalidated whether it succeeds or not,
    /// since a failed write may still have reached the server.
    pub async fn mutate<F, Fut, R>(&self, invalidations: &[Invalidate], op: F) -> Result<R, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ApiError>>,
    {
        let result = self.inner.loading.with_loading(self.loading_key("save"), op()).await;
        for invalidation in invalidations {
            self.apply(invalidation);
        }
        result
    }

    fn apply(&self, invalidation: &Invalidate) {
        match invalidation {
            Invalidate::Key(key) => {
                self.inner.cache.invalidate(key);
            }
            Invalidate::Prefix(prefix) => {
                self.inner.cache.invalidate_prefix(prefix);
            }
            Invalidate::All => self.inner.cache.invalidate_all(),
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.cache.invalidate(key)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner.cache.invalidate_prefix(prefix)
    }

    pub fn invalidate_all(&self) {
        tracing::trace!(store = %self.inner.name, "cache cleared");
        self.inner.cache.invalidate_all();
    }

    pub fn state(&self) -> StoreState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreState<T>> {
        self.inner.state.subscribe()
    }

    /// Reset the observable state. The cache is left alone.
    pub fn clear_state(&self) {
        self.inner.state.send_replace(StoreState::default());
    }
}

impl<T> StoreInner<T> {
    fn set_data(&self, data: T) {
        let now = self.clock.now_millis();
        self.state.send_modify(|s| {
            s.data = Some(data);
            s.error = None;
            s.last_updated = Some(now);
        });
    }

    fn set_error(&self, err: &ApiError) {
        let message = err.message().map(str::to_owned).unwrap_or_else(|| err.to_string());
        self.state.send_modify(|s| s.error = Some(message));
    }
}

/// Keeps `StoreState::loading` up while any load of the store runs.
struct Pending<'a, T> {
    inner: &'a StoreInner<T>,
}

impl<'a, T> Pending<'a, T> {
    fn enter(inner: &'a StoreInner<T>) -> Self {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        inner.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });
        Self { inner }
    }
}

impl<T> Drop for Pending<'_, T> {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.state.send_modify(|s| s.loading = false);
        }
    }
}

/// Listener for a [`ResourceStore::spawn_fetch`] load.
#[derive(Debug)]
pub struct FetchHandle<T> {
    rx: oneshot::Receiver<Result<T, ApiError>>,
}

impl<T> Future for FetchHandle<T> {
    type Output = Result<T, ApiError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ApiError::new(ErrorKind::Unknown).with_message("fetch ended without a result"))
            })
        })
    }
}

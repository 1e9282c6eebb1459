//! Process-wide "in progress" flags.
//!
//! A key is present while at least one operation under it runs and absent otherwise, so the map
//! only ever holds in-flight work. Counts are per key: two overlapping loads of `clients:list`
//! keep the flag up until both finish.

use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct LoadingRegistry {
    state: Arc<watch::Sender<BTreeMap<String, usize>>>,
}

impl Default for LoadingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { state: Arc::new(tx) }
    }

    pub fn start(&self, key: &str) {
        self.state.send_modify(|map| *map.entry(key.to_owned()).or_insert(0) += 1);
    }

    /// End one operation under `key`. Returns true if that was the last one.
    pub fn finish(&self, key: &str) -> bool {
        let mut last = false;
        self.state.send_if_modified(|map| match map.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                map.remove(key);
                last = true;
                true
            }
            None => false,
        });
        last
    }

    /// Flag-style control: `true` starts an operation, `false` drops the key outright.
    pub fn set_loading(&self, key: &str, loading: bool) {
        if loading {
            self.start(key);
        } else {
            self.state.send_if_modified(|map| map.remove(key).is_some());
        }
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.state.borrow().contains_key(key)
    }

    pub fn is_any_loading(&self) -> bool {
        !self.state.borrow().is_empty()
    }

    /// Keys currently in progress.
    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    /// Operations in progress across all keys.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().values().sum()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.borrow().keys().cloned().collect()
    }

    pub fn clear_all(&self) {
        self.state.send_if_modified(|map| {
            let had_any = !map.is_empty();
            map.clear();
            had_any
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, usize>> {
        self.state.subscribe()
    }

    /// Loading flag of one key; yields the current value first, then only changes.
    pub fn watch_key(&self, key: impl Into<String>) -> impl Stream<Item = bool> + Send + 'static {
        let rx = self.state.subscribe();
        futures::stream::unfold((rx, key.into(), None), |(mut rx, key, last)| async move {
            loop {
                let current = rx.borrow_and_update().contains_key(&key);
                if last != Some(current) {
                    return Some((current, (rx, key, Some(current))));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// Mark `key` in progress until the guard drops.
    pub fn guard(&self, key: impl Into<String>) -> LoadingGuard {
        let key = key.into();
        self.start(&key);
        LoadingGuard { registry: self.clone(), key }
    }

    /// Run `operation` with `key` marked in progress. The flag comes down on completion, error or
    /// cancellation of the returned future.
    pub async fn with_loading<F, T>(&self, key: impl Into<String>, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.guard(key);
        operation.await
    }
}

/// Ends one operation under its key on drop.
#[derive(Debug)]
pub struct LoadingGuard {
    registry: LoadingRegistry,
    key: String,
}

impl LoadingGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.key);
    }
}

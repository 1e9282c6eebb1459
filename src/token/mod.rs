//! Access/refresh token ownership.
//!
//! [`TokenStore`] is the only writer of the token pair. It reads and writes through a
//! [`TokenStorage`] backend and publishes the decoded access-token expiry on a `watch` channel;
//! the proactive refresh timer listens to that channel, so setting a token arms the timer and
//! clearing the tokens disarms it.

mod claims;
mod storage;

pub use claims::decode_expiry;
pub use storage::{
    EphemeralStorage, FileStorage, MemoryStorage, StorageError, TokenStorage, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};

use crate::clock::Clock;
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of the stored credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Decoded `exp` claim of the access token, epoch seconds.
    pub access_expiry: Option<u64>,
}

#[derive(Debug)]
pub struct TokenStore {
    storage: Arc<dyn TokenStorage>,
    clock: Arc<dyn Clock>,
    expiry: watch::Sender<Option<u64>>,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn TokenStorage>, clock: Arc<dyn Clock>) -> Self {
        // A token persisted by an earlier run arms the timer straight away.
        let initial = storage.get(ACCESS_TOKEN_KEY).as_deref().and_then(decode_expiry);
        let (expiry, _rx) = watch::channel(initial);
        Self { storage, clock, expiry }
    }

    pub fn get_access(&self) -> Option<String> {
        self.storage.get(ACCESS_TOKEN_KEY)
    }

    pub fn get_refresh(&self) -> Option<String> {
        self.storage.get(REFRESH_TOKEN_KEY)
    }

    pub fn set_access(&self, token: &str) {
        if let Err(e) = self.storage.set(ACCESS_TOKEN_KEY, token) {
            tracing::warn!(error = %e, "failed to persist access token");
        }
        // Read back so a backend that drops writes never arms the timer.
        self.expiry.send_replace(self.access_expiry());
    }

    pub fn set_refresh(&self, token: &str) {
        if let Err(e) = self.storage.set(REFRESH_TOKEN_KEY, token) {
            tracing::warn!(error = %e, "failed to persist refresh token");
        }
    }

    /// Forget both tokens.
    pub fn clear(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!(key, error = %e, "failed to remove token");
            }
        }
        self.expiry.send_replace(None);
    }

    pub fn token_pair(&self) -> Option<TokenPair> {
        let access_token = self.get_access()?;
        let access_expiry = decode_expiry(&access_token);
        Some(TokenPair { access_token, refresh_token: self.get_refresh(), access_expiry })
    }

    pub fn access_expiry(&self) -> Option<u64> {
        self.get_access().as_deref().and_then(decode_expiry)
    }

    /// True if an access token is stored and its `exp` claim is still in the future.
    /// A token that does not decode counts as invalid.
    pub fn is_valid(&self) -> bool {
        self.access_expiry().is_some_and(|exp| self.clock.now_secs() < exp)
    }

    /// Observe the access-token expiry; `None` while no decodable token is stored.
    pub fn watch_expiry(&self) -> watch::Receiver<Option<u64>> {
        self.expiry.subscribe()
    }
}

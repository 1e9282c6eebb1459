//! Single-flight token refresh and session authority.
//!
//! [`RefreshCoordinator`] is a two-state machine (`Idle`, `Refreshing`). The first caller of
//! [`RefreshCoordinator::refresh`] flips it to `Refreshing` and spawns the refresh task; every
//! caller, the first included, parks a `oneshot` waiter. When the task finishes it swaps the phase
//! back to `Idle` and releases the waiters in registration order with the same outcome. Because the
//! check-and-flip happens under one lock with no `.await` in between, at most one refresh call is
//! ever in flight.
//!
//! The coordinator also owns the session: [`establish`](RefreshCoordinator::establish) stores a
//! grant after login, register or refresh, and [`logout`](RefreshCoordinator::logout) clears it.
//! A failed refresh, reactive or proactive, is a forced logout.

use crate::clock::Clock;
use crate::config::AuthEndpoints;
use crate::request::{ApiRequest, ApiResponse};
use crate::session::{TokenGrant, User};
use crate::sleeper::Sleeper;
use crate::token::TokenStore;
use crate::{ApiError, ErrorKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_service::Service;

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserInitiated,
    RefreshFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No session was ever established by this client.
    Anonymous,
    Authenticated,
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

/// Exchanges a refresh token for a new grant.
#[async_trait]
pub trait Refresher: Send + Sync + fmt::Debug {
    async fn refresh(&self, refresh_token: Option<String>) -> Result<TokenGrant, ApiError>;
}

/// [`Refresher`] that posts to the refresh endpoint on the raw transport, bypassing the pipeline.
#[derive(Clone)]
pub struct TransportRefresher<S> {
    transport: S,
    path: String,
}

impl<S> TransportRefresher<S> {
    pub fn new(transport: S, auth: &AuthEndpoints) -> Self {
        Self { transport, path: auth.refresh.clone() }
    }
}

impl<S> fmt::Debug for TransportRefresher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRefresher").field("path", &self.path).finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> Refresher for TransportRefresher<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    async fn refresh(&self, refresh_token: Option<String>) -> Result<TokenGrant, ApiError> {
        let req = ApiRequest::post(self.path.clone())
            .with_body(json!({ "refresh_token": refresh_token }))
            .no_retry();
        let resp = self.transport.clone().oneshot(req).await?.error_for_status()?;
        let data = resp.into_envelope::<Value>()?.into_data().map_err(|_| refresh_failed())?;
        serde_json::from_value(data).map_err(|_| refresh_failed())
    }
}

fn refresh_failed() -> ApiError {
    ApiError::new(ErrorKind::Unauthorized).with_message("Token refresh failed")
}

type Waiter = oneshot::Sender<Result<String, ApiError>>;

enum Phase {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

pub struct RefreshCoordinator {
    tokens: Arc<TokenStore>,
    refresher: Arc<dyn Refresher>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    lead: Duration,
    phase: Mutex<Phase>,
    status: watch::Sender<AuthStatus>,
    user: Mutex<Option<User>>,
    refreshes: AtomicUsize,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("phase", &self.phase())
            .field("status", &self.status())
            .field("refreshes", &self.refresh_count())
            .field("lead", &self.lead)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshCoordinator {
    /// `lead` is how long before expiry the proactive refresh fires.
    pub fn new(
        tokens: Arc<TokenStore>,
        refresher: Arc<dyn Refresher>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        lead: Duration,
    ) -> Self {
        let initial =
            if tokens.get_access().is_some() { AuthStatus::Authenticated } else { AuthStatus::Anonymous };
        let (status, _rx) = watch::channel(initial);
        Self {
            tokens,
            refresher,
            clock,
            sleeper,
            lead,
            phase: Mutex::new(Phase::Idle),
            status,
            user: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn phase(&self) -> RefreshPhase {
        match *lock(&self.phase) {
            Phase::Idle => RefreshPhase::Idle,
            Phase::Refreshing { .. } => RefreshPhase::Refreshing,
        }
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub fn current_user(&self) -> Option<User> {
        lock(&self.user).clone()
    }

    /// Refresh calls made so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Store a grant from login, register or refresh.
    pub fn establish(&self, grant: TokenGrant) {
        self.tokens.set_access(&grant.token);
        if let Some(refresh) = &grant.refresh_token {
            self.tokens.set_refresh(refresh);
        }
        if let Some(user) = grant.user {
            *lock(&self.user) = Some(user);
        }
        self.status.send_replace(AuthStatus::Authenticated);
    }

    /// Clear tokens and user. Clearing the tokens also disarms the proactive timer.
    pub fn logout(&self, reason: LogoutReason) {
        self.tokens.clear();
        *lock(&self.user) = None;
        match reason {
            LogoutReason::UserInitiated => tracing::info!("logged out"),
            LogoutReason::RefreshFailed => tracing::warn!("session ended: token refresh failed"),
        }
        self.status.send_replace(AuthStatus::LoggedOut { reason });
    }

    /// Obtain a fresh access token, joining the in-flight refresh if there is one.
    ///
    /// The refresh runs in its own task, so dropping this future only detaches the caller.
    pub async fn refresh(self: &Arc<Self>) -> Result<String, ApiError> {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut phase = lock(&self.phase);
            match &mut *phase {
                Phase::Refreshing { waiters } => {
                    waiters.push(tx);
                    false
                }
                Phase::Idle => {
                    *phase = Phase::Refreshing { waiters: vec![tx] };
                    true
                }
            }
        };

        if start {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_refresh().await });
        } else {
            tracing::debug!("joining in-flight token refresh");
        }

        rx.await.unwrap_or_else(|_| {
            Err(ApiError::new(ErrorKind::Unauthorized).with_message("token refresh was abandoned"))
        })
    }

    async fn run_refresh(&self) {
        // Resets the phase even if the refresher panics; orphaned waiters then see a closed channel.
        let mut reset = PhaseReset { phase: &self.phase, released: false };
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tracing::info!("refreshing access token");

        let outcome = match self.refresher.refresh(self.tokens.get_refresh()).await {
            Ok(grant) => {
                let token = grant.token.clone();
                self.establish(grant);
                tracing::info!("access token refreshed");
                Ok(token)
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed; forcing logout");
                self.logout(LogoutReason::RefreshFailed);
                Err(err)
            }
        };

        let waiters = reset.take_waiters();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// How long until the proactive refresh for a token expiring at `exp` (epoch seconds) fires.
    pub fn delay_until_refresh(&self, exp: u64) -> Duration {
        let lead_ms = u64::try_from(self.lead.as_millis()).unwrap_or(u64::MAX);
        let fire_at = exp.saturating_mul(1000).saturating_sub(lead_ms);
        Duration::from_millis(fire_at.saturating_sub(self.clock.now_millis()))
    }

    /// Start the proactive refresh timer. It re-arms on every token change and is disarmed while
    /// no token is stored. Dropping the handle stops it.
    pub fn spawn_proactive(self: &Arc<Self>) -> ProactiveRefresh {
        let this = Arc::clone(self);
        ProactiveRefresh { handle: tokio::spawn(async move { this.proactive_loop().await }) }
    }

    async fn proactive_loop(self: Arc<Self>) {
        let mut expiry = self.tokens.watch_expiry();
        loop {
            let current = *expiry.borrow_and_update();
            let Some(exp) = current else {
                if expiry.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let delay = self.delay_until_refresh(exp);
            tracing::debug!(exp, delay_secs = delay.as_secs(), "proactive refresh armed");
            tokio::select! {
                changed = expiry.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = self.sleeper.sleep(delay) => {}
            }

            tracing::info!(exp, "access token near expiry; refreshing proactively");
            // Failure has already logged the session out.
            let _ = self.refresh().await;

            // Same expiry after the refresh: wait for a real change instead of spinning.
            let unchanged = *expiry.borrow_and_update() == Some(exp);
            if unchanged && expiry.changed().await.is_err() {
                return;
            }
        }
    }
}

struct PhaseReset<'a> {
    phase: &'a Mutex<Phase>,
    released: bool,
}

impl PhaseReset<'_> {
    /// Back to `Idle`, handing over the waiters registered so far.
    fn take_waiters(&mut self) -> Vec<Waiter> {
        self.released = true;
        match std::mem::replace(&mut *lock(self.phase), Phase::Idle) {
            Phase::Refreshing { waiters } => waiters,
            Phase::Idle => Vec::new(),
        }
    }
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        if !self.released {
            *lock(self.phase) = Phase::Idle;
        }
    }
}

/// Handle to the proactive refresh task. Dropping it stops the timer.
#[derive(Debug)]
pub struct ProactiveRefresh {
    handle: JoinHandle<()>,
}

impl ProactiveRefresh {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ProactiveRefresh {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

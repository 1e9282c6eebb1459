//! Retry policy engine.
//!
//! Semantics:
//! - `max_attempts` counts retries after the initial try, so a request is sent at most
//!   `max_attempts + 1` times.
//! - Eligibility, in order: an explicit `no_retry` flag; token endpoints (the refresh
//!   coordinator owns those); `DELETE`; `POST` unless marked idempotent. Eligible requests are
//!   retried on network errors and on statuses in `retryable_statuses`.
//! - Delay before retry `n` (1-indexed) is `min(base * 2^(n-1) + jitter, max_delay)`, or
//!   `min(base + jitter, max_delay)` when exponential growth is disabled.
//! - On exhaustion the last failure is returned unchanged.
//! - Per-request tuning comes from [`RetryOverride`](crate::RetryOverride) on the request itself.
//!
//! Example
//! ```rust
//! use vetcare_net::{ApiError, ApiRequest, InstantSleeper, RetryConfig, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .config(RetryConfig { max_attempts: 2, ..RetryConfig::default() })
//!     .with_sleeper(InstantSleeper)
//!     .build();
//! let req = ApiRequest::get("/clients");
//! let result: Result<(), ApiError> =
//!     policy.execute(&req, || async { Err(ApiError::network("connection refused")) }).await;
//! assert!(result.unwrap_err().is_network());
//! # });
//! ```

use crate::config::AuthEndpoints;
use crate::notify::{Notification, NotificationSink, Severity};
use crate::request::{ApiRequest, ApiResponse, Method, RetryOverride};
use crate::{ApiError, Backoff, Jitter, Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Statuses retried by default: request timeout, too many requests, and transient server errors.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Retry tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: bool,
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential: true,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// This config with a request's override applied.
    pub fn with_override(&self, o: &RetryOverride) -> RetryConfig {
        let mut cfg = self.clone();
        if let Some(max) = o.max_attempts {
            cfg.max_attempts = max;
        }
        if let Some(base) = o.base_delay {
            cfg.base_delay_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(exponential) = o.exponential {
            cfg.exponential = exponential;
        }
        cfg
    }

    pub fn backoff(&self) -> Backoff {
        let base = self.base_delay();
        let backoff = if self.exponential { Backoff::exponential(base) } else { Backoff::constant(base) };
        // An override may push the base past the cap; the cap then follows the base.
        let max = self.max_delay().max(base);
        backoff.with_max(max).unwrap_or(backoff)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// Why a failure is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The request carries the `no_retry` flag.
    Disabled,
    /// Login, register and refresh are never retried.
    AuthEndpoint,
    /// `DELETE`, or `POST` not marked idempotent.
    NotIdempotent,
    /// The failure is neither a network error nor a retryable status.
    NotRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Skip(SkipReason),
}

/// Retry policy combining eligibility rules, backoff, jitter and a sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    auth: AuthEndpoints,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .field("jitter", &self.jitter)
            .field("sleeper", &"<sleeper>")
            .field("notifier", &self.notifier.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The config in force for `req`.
    pub fn effective_config(&self, req: &ApiRequest) -> RetryConfig {
        self.config.with_override(&req.options.retry)
    }

    /// Request-level rules, independent of how the request failed.
    pub fn request_eligibility(&self, req: &ApiRequest) -> RetryDecision {
        if req.options.no_retry {
            return RetryDecision::Skip(SkipReason::Disabled);
        }
        if self.auth.is_auth(&req.path) {
            return RetryDecision::Skip(SkipReason::AuthEndpoint);
        }
        match req.method {
            Method::Delete => RetryDecision::Skip(SkipReason::NotIdempotent),
            Method::Post if !req.options.idempotent => RetryDecision::Skip(SkipReason::NotIdempotent),
            _ => RetryDecision::Retry,
        }
    }

    /// Full decision for a failure of `req` under `config`.
    pub fn classify(&self, req: &ApiRequest, err: &ApiError, config: &RetryConfig) -> RetryDecision {
        if let RetryDecision::Skip(reason) = self.request_eligibility(req) {
            return RetryDecision::Skip(reason);
        }
        let retryable = err.is_network() || err.status().is_some_and(|s| config.is_retryable_status(s));
        if retryable {
            RetryDecision::Retry
        } else {
            RetryDecision::Skip(SkipReason::NotRetryable)
        }
    }

    /// Jittered delay before retry `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: usize, config: &RetryConfig) -> Duration {
        config.backoff().jittered(attempt, &self.jitter)
    }

    /// Run `operation` for `req`, retrying per the policy.
    pub async fn execute<T, Fut, Op>(&self, req: &ApiRequest, mut operation: Op) -> Result<T, ApiError>
    where
        Fut: Future<Output = Result<T, ApiError>>,
        Op: FnMut() -> Fut,
    {
        let config = self.effective_config(req);
        let mut retries = 0usize;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.classify(req, &err, &config) {
                RetryDecision::Skip(reason) => {
                    tracing::trace!(method = %req.method, path = %req.path, ?reason, "not retrying");
                    return Err(err);
                }
                RetryDecision::Retry if retries >= config.max_attempts => {
                    tracing::warn!(
                        method = %req.method,
                        path = %req.path,
                        retries,
                        error = %err,
                        "request failed after exhausting retries"
                    );
                    return Err(err);
                }
                RetryDecision::Retry => {
                    retries += 1;
                    let delay = self.delay_for(retries, &config);
                    tracing::debug!(
                        method = %req.method,
                        path = %req.path,
                        attempt = retries,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    if retries > 1 {
                        if let Some(sink) = &self.notifier {
                            sink.notify(
                                Notification::new(
                                    Severity::Info,
                                    format!("Retrying request... (attempt {retries}/{})", config.max_attempts),
                                )
                                .with_title("Connection Issue")
                                .with_duration(Duration::from_millis(2_000)),
                            );
                        }
                    }
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }

    /// Wrap this policy as a tower layer.
    pub fn into_layer(self) -> RetryLayer {
        RetryLayer::new(self)
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    config: RetryConfig,
    auth: AuthEndpoints,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
            auth: AuthEndpoints::default(),
            jitter: Jitter::additive(),
            sleeper: Arc::new(TokioSleeper),
            notifier: None,
        }
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn auth_endpoints(mut self, auth: AuthEndpoints) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Sink for the "retrying..." notices shown from the second retry on.
    pub fn notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            config: self.config,
            auth: self.auth,
            jitter: self.jitter,
            sleeper: self.sleeper,
            notifier: self.notifier,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer applying a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: Arc<RetryPolicy>,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy: Arc::new(policy) }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService { inner, policy: Arc::clone(&self.policy) }
    }
}

/// Service produced by [`RetryLayer`].
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: Arc<RetryPolicy>,
}

impl<S> Service<ApiRequest> for RetryService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = BoxFuture<'static, Result<ApiResponse, ApiError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), ApiError>> {
        // Each attempt drives its own clone of `inner` to readiness.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let policy = Arc::clone(&self.policy);
        let inner = self.inner.clone();
        Box::pin(async move {
            let outbound = req.clone();
            policy.execute(&req, move || inner.clone().oneshot(outbound.clone())).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstantSleeper, NotificationCenter, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::builder().with_sleeper(InstantSleeper).with_jitter(Jitter::None).build()
    }

    async fn run_with_status(policy: &RetryPolicy, req: &ApiRequest, status: u16) -> (usize, ApiError) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let err = policy
            .execute(req, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ApiError::from_response(status, &serde_json::Value::Null))
                }
            })
            .await
            .unwrap_err();
        (attempts.load(Ordering::SeqCst), err)
    }

    #[tokio::test]
    async fn always_503_is_attempted_max_plus_one_times() {
        let (attempts, err) = run_with_status(&policy(), &ApiRequest::get("/clients"), 503).await;
        assert_eq!(attempts, 4);
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn delete_and_plain_post_are_attempted_once() {
        let p = policy();
        assert_eq!(run_with_status(&p, &ApiRequest::delete("/pets/3"), 503).await.0, 1);
        assert_eq!(run_with_status(&p, &ApiRequest::post("/pets"), 503).await.0, 1);
        assert_eq!(run_with_status(&p, &ApiRequest::post("/pets").idempotent(), 503).await.0, 4);
    }

    #[tokio::test]
    async fn non_retryable_statuses_fail_fast() {
        let p = policy();
        for status in [400, 401, 403, 404, 409, 422] {
            assert_eq!(run_with_status(&p, &ApiRequest::get("/clients"), status).await.0, 1, "{status}");
        }
        for status in DEFAULT_RETRYABLE_STATUSES {
            assert_eq!(run_with_status(&p, &ApiRequest::put("/clients/1"), status).await.0, 4, "{status}");
        }
    }

    #[tokio::test]
    async fn flags_and_auth_endpoints_disable_retry() {
        let p = policy();
        assert_eq!(run_with_status(&p, &ApiRequest::get("/clients").no_retry(), 503).await.0, 1);
        assert_eq!(run_with_status(&p, &ApiRequest::get("/auth/refresh"), 503).await.0, 1);
        assert_eq!(
            p.request_eligibility(&ApiRequest::post("/auth/login").idempotent()),
            RetryDecision::Skip(SkipReason::AuthEndpoint)
        );
    }

    #[tokio::test]
    async fn network_errors_are_retried_then_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = policy()
            .execute(&ApiRequest::get("/appointments"), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ApiError::network("connection reset"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exponential_schedule_without_jitter() {
        let sleeper = TrackingSleeper::new();
        let p = RetryPolicy::builder().with_sleeper(sleeper.clone()).with_jitter(Jitter::None).build();
        run_with_status(&p, &ApiRequest::get("/clients"), 502).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(1_000), Duration::from_millis(2_000), Duration::from_millis(4_000)]
        );
    }

    #[tokio::test]
    async fn request_override_changes_attempts_and_growth() {
        let sleeper = TrackingSleeper::new();
        let p = RetryPolicy::builder().with_sleeper(sleeper.clone()).with_jitter(Jitter::None).build();
        let req = ApiRequest::get("/clients").retry_override(RetryOverride {
            max_attempts: Some(5),
            base_delay: Some(Duration::from_millis(200)),
            exponential: Some(false),
        });
        let (attempts, _) = run_with_status(&p, &req, 504).await;
        assert_eq!(attempts, 6);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(200); 5]);
        assert_eq!(p.config().max_attempts, 3, "override must not leak into the policy");
    }

    #[tokio::test]
    async fn jittered_delays_respect_bounds() {
        let sleeper = TrackingSleeper::new();
        let p = RetryPolicy::builder()
            .config(RetryConfig { max_attempts: 6, ..RetryConfig::default() })
            .with_sleeper(sleeper.clone())
            .build();
        run_with_status(&p, &ApiRequest::get("/clients"), 500).await;
        let calls = sleeper.calls();
        assert_eq!(calls.len(), 6);
        let fifth = calls[4];
        assert!(fifth >= Duration::from_millis(16_000) && fifth < Duration::from_millis(31_000));
        assert!(calls.iter().all(|d| *d <= Duration::from_millis(30_000)));
    }

    #[tokio::test]
    async fn notifies_from_second_retry_on() {
        let center = NotificationCenter::new().without_auto_dismiss();
        let p = RetryPolicy::builder()
            .with_sleeper(InstantSleeper)
            .notifier(Arc::new(center.clone()))
            .build();
        run_with_status(&p, &ApiRequest::get("/clients"), 503).await;
        let messages: Vec<_> = center.active().into_iter().map(|n| n.message).collect();
        assert_eq!(
            messages,
            vec!["Retrying request... (attempt 2/3)", "Retrying request... (attempt 3/3)"]
        );
        assert_eq!(center.active()[0].title, "Connection Issue");
    }

    #[tokio::test]
    async fn layer_retries_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = tower::service_fn(move |_req: ApiRequest| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::from_response(429, &serde_json::Value::Null))
                } else {
                    Ok(ApiResponse::new(200, serde_json::Value::Null))
                }
            }
        });
        let svc = policy().into_layer().layer(inner);
        let resp = svc.oneshot(ApiRequest::get("/vaccinations")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

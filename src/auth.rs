//! Bearer-token attachment and 401 recovery.
//!
//! Requests to the login, register and refresh endpoints pass through untouched. Everything else
//! gets `Authorization: Bearer <token>` when a token is stored; a request without one still goes
//! out and the backend decides. A 401 hands over to the [`RefreshCoordinator`]: on success the
//! request is resent once with the new token, on failure the original 401 is returned.

use crate::config::AuthEndpoints;
use crate::refresh::RefreshCoordinator;
use crate::request::{ApiRequest, ApiResponse};
use crate::ApiError;
use futures::future::BoxFuture;
use std::sync::Arc;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

#[derive(Debug, Clone)]
pub struct AuthLayer {
    coordinator: Arc<RefreshCoordinator>,
    endpoints: Arc<AuthEndpoints>,
}

impl AuthLayer {
    pub fn new(coordinator: Arc<RefreshCoordinator>, endpoints: AuthEndpoints) -> Self {
        Self { coordinator, endpoints: Arc::new(endpoints) }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            coordinator: Arc::clone(&self.coordinator),
            endpoints: Arc::clone(&self.endpoints),
        }
    }
}

/// Service produced by [`AuthLayer`].
#[derive(Debug, Clone)]
pub struct AuthService<S> {
    inner: S,
    coordinator: Arc<RefreshCoordinator>,
    endpoints: Arc<AuthEndpoints>,
}

impl<S> Service<ApiRequest> for AuthService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = BoxFuture<'static, Result<ApiResponse, ApiError>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), ApiError>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: ApiRequest) -> Self::Future {
        // The inner service was driven to readiness; keep that instance for the first send.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.endpoints.is_auth(&req.path) {
            return Box::pin(inner.call(req));
        }

        let coordinator = Arc::clone(&self.coordinator);
        Box::pin(async move {
            if let Some(token) = coordinator.tokens().get_access() {
                req.set_bearer(&token);
            }
            let resend = req.clone();

            let err = match inner.call(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_unauthorized() => err,
                Err(err) => return Err(err),
            };

            tracing::debug!(method = %resend.method, path = %resend.path, "401 received; refreshing token");
            match coordinator.refresh().await {
                Ok(token) => {
                    let mut resend = resend;
                    resend.set_bearer(&token);
                    inner.oneshot(resend).await
                }
                Err(refresh_err) => {
                    tracing::debug!(error = %refresh_err, "refresh failed; surfacing original 401");
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::refresh::{AuthStatus, LogoutReason, Refresher};
    use crate::session::TokenGrant;
    use crate::sleeper::InstantSleeper;
    use crate::token::{MemoryStorage, TokenStore};
    use crate::ErrorKind;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct FixedRefresher(Result<TokenGrant, ApiError>);

    #[async_trait]
    impl Refresher for FixedRefresher {
        async fn refresh(&self, _refresh_token: Option<String>) -> Result<TokenGrant, ApiError> {
            self.0.clone()
        }
    }

    fn coordinator(result: Result<TokenGrant, ApiError>) -> Arc<RefreshCoordinator> {
        let clock = Arc::new(ManualClock::new(0));
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStorage::new()), clock.clone()));
        Arc::new(RefreshCoordinator::new(
            tokens,
            Arc::new(FixedRefresher(result)),
            clock,
            Arc::new(InstantSleeper),
            Duration::from_secs(300),
        ))
    }

    /// Answers 401 unless the request carries `Bearer fresh`; records the bearer it saw.
    fn transport(
        seen: Arc<Mutex<Vec<Option<String>>>>,
    ) -> impl Service<ApiRequest, Response = ApiResponse, Error = ApiError, Future = impl Send> + Clone + Send
    {
        tower::service_fn(move |req: ApiRequest| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(req.bearer().map(str::to_owned));
                if req.bearer() == Some("fresh") {
                    Ok(ApiResponse::new(200, Value::Null))
                } else {
                    Err(ApiError::from_response(401, &Value::Null))
                }
            }
        })
    }

    #[tokio::test]
    async fn attaches_token_and_resends_after_refresh() {
        let coord = coordinator(Ok(TokenGrant::new("fresh")));
        coord.tokens().set_access("stale");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let svc = AuthLayer::new(coord.clone(), AuthEndpoints::default()).layer(transport(seen.clone()));

        let resp = svc.oneshot(ApiRequest::get("/pets")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(*seen.lock().unwrap(), vec![Some("stale".to_owned()), Some("fresh".to_owned())]);
        assert_eq!(coord.refresh_count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_returns_original_401() {
        let coord = coordinator(Err(ApiError::network("down")));
        coord.tokens().set_access("stale");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let svc = AuthLayer::new(coord.clone(), AuthEndpoints::default()).layer(transport(seen.clone()));

        let err = svc.oneshot(ApiRequest::get("/pets")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(coord.status(), AuthStatus::LoggedOut { reason: LogoutReason::RefreshFailed });
    }

    #[tokio::test]
    async fn auth_endpoints_skip_token_and_refresh() {
        let coord = coordinator(Ok(TokenGrant::new("fresh")));
        coord.tokens().set_access("stale");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let svc = AuthLayer::new(coord.clone(), AuthEndpoints::default()).layer(transport(seen.clone()));

        let err = svc.oneshot(ApiRequest::post("/auth/login")).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(*seen.lock().unwrap(), vec![None]);
        assert_eq!(coord.refresh_count(), 0);
    }

    #[tokio::test]
    async fn missing_token_still_sends() {
        let coord = coordinator(Ok(TokenGrant::new("fresh")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let svc = AuthLayer::new(coord, AuthEndpoints::default()).layer(transport(seen.clone()));
        let resp = svc.oneshot(ApiRequest::get("/veterinarians")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(seen.lock().unwrap()[0], None);
    }
}

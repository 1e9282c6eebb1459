//! The assembled client.
//!
//! [`ApiClient`] owns one [`ClientContext`] and the composed pipeline, outermost first:
//!
//! ```text
//! ErrorReportLayer -> RetryLayer -> AuthLayer -> transport
//! ```
//!
//! Retry sits outside auth so every attempt re-reads the current token, and error reporting sits
//! outside retry so the user hears about a failure once, after recovery has been exhausted.

use crate::auth::{AuthLayer, AuthService};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClientConfig, ConfigError};
use crate::loading::LoadingRegistry;
use crate::notify::{NotificationSink, TracingSink};
use crate::refresh::{LogoutReason, ProactiveRefresh, RefreshCoordinator, Refresher, TransportRefresher};
use crate::report::{ErrorReportLayer, ErrorReportService};
use crate::request::{ApiRequest, ApiResponse};
use crate::resource::{Collection, CollectionRegistry, ResourceKind};
use crate::retry::{RetryLayer, RetryPolicy, RetryService};
use crate::session::{Credentials, Registration, TokenGrant, User};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::token::{MemoryStorage, TokenStorage, TokenStore};
use crate::{ApiError, Jitter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tower::{ServiceBuilder, ServiceExt};
use tower_service::Service;

/// The composed request pipeline around transport `S`.
pub type Pipeline<S> = ErrorReportService<RetryService<AuthService<S>>>;

/// Everything the components of one client share.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub config: Arc<ClientConfig>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<TokenStore>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub notifier: Arc<dyn NotificationSink>,
    pub loading: LoadingRegistry,
    pub collections: CollectionRegistry,
}

pub struct ApiClientBuilder<S> {
    transport: S,
    config: ClientConfig,
    storage: Arc<dyn TokenStorage>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    notifier: Arc<dyn NotificationSink>,
    jitter: Jitter,
    refresher: Option<Arc<dyn Refresher>>,
    loading: LoadingRegistry,
}

impl<S> ApiClientBuilder<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    pub fn new(transport: S) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            storage: Arc::new(MemoryStorage::new()),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            notifier: Arc::new(TracingSink),
            jitter: Jitter::additive(),
            refresher: None,
            loading: LoadingRegistry::new(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn TokenStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper for backoff delays and the proactive refresh timer.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the default refresher, which posts to the refresh endpoint on the raw transport.
    pub fn refresher(mut self, refresher: Arc<dyn Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Share a loading registry with other clients or views.
    pub fn loading(mut self, loading: LoadingRegistry) -> Self {
        self.loading = loading;
        self
    }

    pub fn build(self) -> Result<ApiClient<S>, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let tokens = Arc::new(TokenStore::new(self.storage, Arc::clone(&self.clock)));
        let refresher = self
            .refresher
            .unwrap_or_else(|| Arc::new(TransportRefresher::new(self.transport.clone(), &config.auth)));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&tokens),
            refresher,
            Arc::clone(&self.clock),
            Arc::clone(&self.sleeper),
            config.refresh_lead(),
        ));

        let retry = RetryPolicy::builder()
            .config(config.retry.clone())
            .auth_endpoints(config.auth.clone())
            .with_jitter(self.jitter)
            .with_shared_sleeper(self.sleeper)
            .notifier(Arc::clone(&self.notifier))
            .build();

        let pipeline = ServiceBuilder::new()
            .layer(ErrorReportLayer::new(Arc::clone(&self.notifier), config.auth.clone()))
            .layer(RetryLayer::new(retry))
            .layer(AuthLayer::new(Arc::clone(&coordinator), config.auth.clone()))
            .service(self.transport);

        tracing::debug!(base_url = %config.base_url, "api client built");
        Ok(ApiClient {
            ctx: ClientContext {
                config,
                clock: self.clock,
                tokens,
                coordinator,
                notifier: self.notifier,
                loading: self.loading,
                collections: CollectionRegistry::new(),
            },
            pipeline,
        })
    }
}

/// Clinic API client. Clones share tokens, session and pipeline configuration.
#[derive(Debug, Clone)]
pub struct ApiClient<S> {
    ctx: ClientContext,
    pipeline: Pipeline<S>,
}

#[cfg(feature = "reqwest-transport")]
impl ApiClient<crate::transport::ReqwestTransport> {
    /// Client over HTTP with default collaborators.
    pub fn from_config(config: ClientConfig) -> Result<Self, ConfigError> {
        let transport = crate::transport::ReqwestTransport::new(&config.base_url);
        ApiClientBuilder::new(transport).config(config).build()
    }
}

impl<S> ApiClient<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    pub fn builder(transport: S) -> ApiClientBuilder<S> {
        ApiClientBuilder::new(transport)
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.ctx.tokens
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.ctx.coordinator
    }

    pub fn loading(&self) -> &LoadingRegistry {
        &self.ctx.loading
    }

    /// Send through the full pipeline.
    pub async fn send(&self, req: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.pipeline.clone().oneshot(req).await
    }

    /// Send and unwrap the envelope's `data`.
    pub async fn request_data<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, ApiError> {
        self.send(req).await?.into_envelope::<T>()?.into_data()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_data(ApiRequest::get(path)).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.request_data(ApiRequest::post(path).with_json(body)?).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.request_data(ApiRequest::put(path).with_json(body)?).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.request_data(ApiRequest::patch(path).with_json(body)?).await
    }

    /// `DELETE`; the response body is ignored.
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<TokenGrant, ApiError> {
        let req = ApiRequest::post(self.ctx.config.auth.login.clone()).with_json(credentials)?;
        self.exchange(req).await
    }

    pub async fn register(&self, registration: &Registration) -> Result<TokenGrant, ApiError> {
        let req = ApiRequest::post(self.ctx.config.auth.register.clone()).with_json(registration)?;
        self.exchange(req).await
    }

    async fn exchange(&self, req: ApiRequest) -> Result<TokenGrant, ApiError> {
        let grant: TokenGrant = self.request_data(req).await?;
        self.ctx.coordinator.establish(grant.clone());
        tracing::info!(user = ?grant.user.as_ref().map(|u| &u.email), "session established");
        Ok(grant)
    }

    pub fn logout(&self) {
        self.ctx.coordinator.logout(LogoutReason::UserInitiated);
    }

    /// True while an unexpired access token is stored. Does not contact the server.
    pub fn is_authenticated(&self) -> bool {
        self.ctx.tokens.is_valid()
    }

    pub fn current_user(&self) -> Option<User> {
        self.ctx.coordinator.current_user()
    }

    /// Start refreshing ahead of token expiry; stops when the handle drops.
    pub fn spawn_proactive_refresh(&self) -> ProactiveRefresh {
        self.ctx.coordinator.spawn_proactive()
    }

    /// Cached accessor for one collection. Accessors for the same kind and item type share one
    /// cache, so a write through any of them invalidates what the others read.
    pub fn collection<T>(&self, kind: ResourceKind) -> Collection<T, S>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Collection::new(kind, self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::refresh::AuthStatus;
    use crate::sleeper::InstantSleeper;
    use crate::NotificationCenter;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(String, Option<String>)>>>;

    #[derive(Clone)]
    struct Scripted {
        log: Log,
        respond: fn(&ApiRequest) -> Result<ApiResponse, ApiError>,
    }

    impl Service<ApiRequest> for Scripted {
        type Response = ApiResponse;
        type Error = ApiError;
        type Future = std::future::Ready<Result<ApiResponse, ApiError>>;

        fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), ApiError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: ApiRequest) -> Self::Future {
            self.log.lock().unwrap().push((req.path.clone(), req.bearer().map(str::to_owned)));
            std::future::ready((self.respond)(&req))
        }
    }

    fn client(
        log: Log,
        respond: fn(&ApiRequest) -> Result<ApiResponse, ApiError>,
    ) -> (ApiClient<Scripted>, NotificationCenter) {
        let center = NotificationCenter::new().without_auto_dismiss();
        let client = ApiClient::builder(Scripted { log, respond })
            .clock(Arc::new(ManualClock::new(0)))
            .sleeper(Arc::new(InstantSleeper))
            .notifier(Arc::new(center.clone()))
            .build()
            .unwrap();
        (client, center)
    }

    fn ok(data: Value) -> Result<ApiResponse, ApiError> {
        Ok(ApiResponse::new(200, json!({ "status": "success", "data": data })))
    }

    #[tokio::test]
    async fn login_establishes_session_and_later_requests_carry_token() {
        let log: Log = Arc::default();
        let (client, _center) = client(log.clone(), |req| match req.path.as_str() {
            "/auth/login" => ok(json!({
                "token": "h.eyJleHAiOjQxMDI0NDQ4MDB9.s",
                "user": { "email": "vet@clinic.example", "first_name": "Ana", "last_name": "Ruiz" }
            })),
            _ => ok(json!([])),
        });

        let grant = client.login(&Credentials::new("vet@clinic.example", "secret")).await.unwrap();
        assert_eq!(grant.user.unwrap().first_name, "Ana");
        assert!(client.is_authenticated());
        assert_eq!(client.current_user().unwrap().email, "vet@clinic.example");

        let pets: Vec<Value> = client.get("/pets").await.unwrap();
        assert!(pets.is_empty());
        let log = log.lock().unwrap();
        assert_eq!(log[0], ("/auth/login".to_owned(), None));
        assert_eq!(log[1].1.as_deref(), Some("h.eyJleHAiOjQxMDI0NDQ4MDB9.s"));

        client.logout();
        assert!(!client.is_authenticated());
        assert_eq!(
            client.coordinator().status(),
            AuthStatus::LoggedOut { reason: LogoutReason::UserInitiated }
        );
    }

    #[tokio::test]
    async fn bad_credentials_are_reported_and_returned() {
        let (client, center) = client(Arc::default(), |_| {
            Err(ApiError::from_response(401, &json!({ "message": "Invalid credentials" })))
        });
        let err = client.login(&Credentials::new("x@y.z", "nope")).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(client.coordinator().refresh_count(), 0);
        let shown = center.active();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Authentication Failed");
        assert_eq!(shown[0].message, "Invalid credentials");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let transport = Scripted { log: Arc::default(), respond: |_| ok(Value::Null) };
        let config = ClientConfig { base_url: " ".into(), ..ClientConfig::default() };
        assert!(ApiClient::builder(transport).config(config).build().is_err());
    }
}

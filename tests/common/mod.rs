#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower_service::Service;
use vetcare_net::{
    ApiClient, ApiClientBuilder, ApiError, ApiRequest, ApiResponse, InstantSleeper, Jitter,
    ManualClock, Method, NotificationCenter,
};

/// What the transport saw for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync;

/// Scripted transport. Every call yields once before answering so concurrent callers interleave.
#[derive(Clone)]
pub struct MockTransport {
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static) -> Self {
        Self { handler: Arc::new(handler), seen: Arc::default() }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| s.path == path).count()
    }
}

impl Service<ApiRequest> for MockTransport {
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = BoxFuture<'static, Result<ApiResponse, ApiError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), ApiError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        self.seen.lock().unwrap().push(Seen {
            method: req.method,
            path: req.path.clone(),
            query: req.query.clone(),
            bearer: req.bearer().map(str::to_owned),
            body: req.body.clone(),
        });
        let result = (self.handler)(&req);
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }
}

/// Route crate logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn ok(data: Value) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(200, json!({ "status": "success", "data": data })))
}

pub fn fail(status: u16, body: Value) -> Result<ApiResponse, ApiError> {
    Err(ApiError::from_response(status, &body))
}

/// Unsigned JWT carrying only an `exp` claim.
pub fn jwt(exp: u64) -> String {
    let payload = URL_SAFE_NO_PAD.encode(json!({ "exp": exp }).to_string());
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig")
}

pub struct Harness {
    pub client: ApiClient<MockTransport>,
    pub transport: MockTransport,
    pub notices: NotificationCenter,
    pub clock: ManualClock,
}

/// Builder preloaded with a manual clock at `now_secs`, instant sleeps, no jitter and a
/// notification center that keeps everything it is shown.
pub fn builder(transport: MockTransport, now_secs: u64) -> (ApiClientBuilder<MockTransport>, NotificationCenter, ManualClock) {
    let notices = NotificationCenter::new().without_auto_dismiss();
    let clock = ManualClock::new(now_secs * 1000);
    let builder = ApiClient::builder(transport)
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(InstantSleeper))
        .jitter(Jitter::None)
        .notifier(Arc::new(notices.clone()));
    (builder, notices, clock)
}

pub fn harness(transport: MockTransport) -> Harness {
    let (builder, notices, clock) = builder(transport.clone(), 1_700_000_000);
    Harness { client: builder.build().unwrap(), transport, notices, clock }
}

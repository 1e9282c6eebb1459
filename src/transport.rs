//! HTTP transport backed by `reqwest`.
//!
//! The transport is the innermost service of the pipeline. It resolves paths against the base
//! URL, sends JSON, and decodes the body as JSON (`Null` when empty or not JSON). Non-2xx
//! statuses become [`ApiError`]s carrying the envelope's text; a request that never got a
//! response is [`ErrorKind::NetworkUnreachable`](crate::ErrorKind::NetworkUnreachable).

use crate::request::{ApiRequest, ApiResponse, Method};
use crate::ApiError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_service::Service;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: Arc<str>,
}

impl ReqwestTransport {
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(http, base_url)
    }

    /// Use a preconfigured client (proxies, TLS roots, custom timeouts).
    pub fn with_client(http: reqwest::Client, base_url: impl AsRef<str>) -> Self {
        Self { http, base_url: Arc::from(base_url.as_ref().trim_end_matches('/')) }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

impl Service<ApiRequest> for ReqwestTransport {
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = BoxFuture<'static, Result<ApiResponse, ApiError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), ApiError>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let mut builder = self
            .http
            .request(to_reqwest(req.method), self.endpoint_url(&req.path))
            .header("accept", "application/json");
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let method = req.method;
        let path = req.path;
        Box::pin(async move {
            let response = builder.send().await.map_err(|e| {
                tracing::debug!(%method, %path, error = %e, "no response");
                ApiError::network(e)
            })?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await.map_err(ApiError::network)?;
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            tracing::trace!(%method, %path, status, "response received");
            ApiResponse::new(status, body).error_for_status()
        })
    }
}

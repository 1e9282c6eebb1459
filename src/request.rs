//! Request and response values flowing through the pipeline.
//!
//! [`RequestOptions`] is the request-scoped override channel: callers opt out of retry, mark a
//! `POST` idempotent, tune retry for one call, or silence the default not-found notification.
//! Nothing here is global; the options travel with the request they belong to.

use crate::ApiError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Header carrying the bearer token.
pub const AUTHORIZATION: &str = "Authorization";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry tuning for a single request. Unset fields fall back to the client defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOverride {
    /// Retries after the initial attempt.
    pub max_attempts: Option<usize>,
    pub base_delay: Option<Duration>,
    pub exponential: Option<bool>,
}

/// Per-request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Never retry this request.
    pub no_retry: bool,
    /// The caller vouches that repeating this request is safe (enables retry for `POST`).
    pub idempotent: bool,
    pub retry: RetryOverride,
    /// A 404 is an expected outcome; do not notify the user about it.
    pub silent_not_found: bool,
}

/// An outbound request, relative to the client's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub options: RequestOptions,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_json<B: Serialize>(self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::new(crate::ErrorKind::Unknown).with_message(e.to_string()))?;
        Ok(self.with_body(value))
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Disable retry for this request.
    pub fn no_retry(mut self) -> Self {
        self.options.no_retry = true;
        self
    }

    /// Mark this request as safe to repeat.
    pub fn idempotent(mut self) -> Self {
        self.options.idempotent = true;
        self
    }

    pub fn retry_override(mut self, retry: RetryOverride) -> Self {
        self.options.retry = retry;
        self
    }

    /// Do not notify the user if this lookup returns 404.
    pub fn silent_not_found(mut self) -> Self {
        self.options.silent_not_found = true;
        self
    }

    /// Bearer token currently attached, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers.get(AUTHORIZATION).and_then(|v| v.strip_prefix("Bearer "))
    }

    pub fn set_bearer(&mut self, token: &str) {
        self.headers.insert(AUTHORIZATION.to_owned(), format!("Bearer {token}"));
    }
}

/// A response as returned by the transport: status plus decoded JSON body (`Null` when empty).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into an [`ApiError`].
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_response(self.status, &self.body))
        }
    }

    /// Decode the body as the backend's uniform envelope.
    pub fn into_envelope<T: DeserializeOwned>(self) -> Result<Envelope<T>, ApiError> {
        let status = self.status;
        serde_json::from_value(self.body).map_err(|e| {
            ApiError::new(crate::ErrorKind::Unknown)
                .with_status(status)
                .with_message(format!("malformed response envelope: {e}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Uniform wrapper the backend puts around every response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: EnvelopeStatus,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Option<BTreeMap<String, Value>>,
}

impl<T> Envelope<T> {
    /// The payload, or an error if the backend reported failure or sent no data.
    pub fn into_data(self) -> Result<T, ApiError> {
        match (self.status, self.data) {
            (EnvelopeStatus::Success, Some(data)) => Ok(data),
            (_, _) => Err(ApiError::new(crate::ErrorKind::Unknown).with_message(
                self.message.unwrap_or_else(|| "response contained no data".to_owned()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[test]
    fn builder_sets_flags_and_bearer() {
        let mut req = ApiRequest::post("/invoices")
            .idempotent()
            .silent_not_found()
            .with_query("page", "2");
        req.set_bearer("abc");

        assert!(req.options.idempotent);
        assert!(req.options.silent_not_found);
        assert!(!req.options.no_retry);
        assert_eq!(req.bearer(), Some("abc"));
        assert_eq!(req.headers[AUTHORIZATION], "Bearer abc");
        assert_eq!(req.query, vec![("page".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn envelope_unwraps_data() {
        let resp = ApiResponse::new(200, json!({ "status": "success", "data": [1, 2, 3] }));
        let data: Vec<u32> = resp.into_envelope().unwrap().into_data().unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn envelope_without_data_is_an_error() {
        let resp = ApiResponse::new(200, json!({ "status": "error", "message": "nope" }));
        let err = resp.into_envelope::<Vec<u32>>().unwrap().into_data().unwrap_err();
        assert_eq!(err.message(), Some("nope"));
    }

    #[test]
    fn envelope_decodes_payloads_without_default() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Pet {
            id: u32,
        }

        let resp = ApiResponse::new(200, json!({ "status": "success", "data": { "id": 4 } }));
        assert_eq!(resp.into_envelope::<Pet>().unwrap().into_data().unwrap(), Pet { id: 4 });
        let bare = ApiResponse::new(200, json!({ "status": "success" }));
        assert!(bare.into_envelope::<Pet>().unwrap().data.is_none());
    }

    #[test]
    fn error_for_status_classifies() {
        let err = ApiResponse::new(403, json!({ "status": "error" })).error_for_status().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(ApiResponse::new(204, Value::Null).error_for_status().is_ok());
    }
}

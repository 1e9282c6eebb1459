//! Error taxonomy for requests against the clinic API.
//!
//! The HTTP status carries the primary signal; the envelope's `message` and `errors` map are
//! supplementary text. A request that never got a response is [`ErrorKind::NetworkUnreachable`]
//! and has no status.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response was received (connection refused, DNS, reset, timeout).
    NetworkUnreachable,
    /// 401
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 422, possibly with several field errors.
    ValidationFailed,
    /// 5xx
    ServerError,
    /// Anything else, including unexpected response shapes.
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            422 => ErrorKind::ValidationFailed,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ValidationFailed => "validation failed",
            ErrorKind::ServerError => "server error",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(label)
    }
}

/// A failed request, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}{}: {}", status_suffix(.status), .message.as_deref().unwrap_or("no message"))]
pub struct ApiError {
    kind: ErrorKind,
    status: Option<u16>,
    message: Option<String>,
    field_errors: BTreeMap<String, String>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ApiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, status: None, message: None, field_errors: BTreeMap::new() }
    }

    /// A request that never received a response.
    pub fn network(detail: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NetworkUnreachable).with_message(detail.to_string())
    }

    /// A response with a non-success status. `body` is the decoded envelope, if any.
    pub fn from_response(status: u16, body: &Value) -> Self {
        let message = body.get("message").and_then(Value::as_str).map(str::to_owned);
        let field_errors = body.get("errors").and_then(Value::as_object).map(|errors| {
            errors
                .iter()
                .map(|(field, detail)| (field.clone(), flatten_detail(detail)))
                .collect()
        });
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message,
            field_errors: field_errors.unwrap_or_default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn field_errors(&self) -> &BTreeMap<String, String> {
        &self.field_errors
    }

    /// True when no response was received.
    pub fn is_network(&self) -> bool {
        self.kind == ErrorKind::NetworkUnreachable
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == ErrorKind::Unauthorized
    }
}

fn flatten_detail(detail: &Value) -> String {
    match detail {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_map_to_taxonomy() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Forbidden);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(409), ErrorKind::Conflict);
        assert_eq!(ErrorKind::from_status(422), ErrorKind::ValidationFailed);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::Unknown);
    }

    #[test]
    fn from_response_reads_envelope_text() {
        let body = json!({
            "status": "error",
            "message": "Validation failed",
            "errors": { "email": "is invalid", "phone": ["too short", "not numeric"] }
        });
        let err = ApiError::from_response(422, &body);
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(err.status(), Some(422));
        assert_eq!(err.message(), Some("Validation failed"));
        assert_eq!(err.field_errors()["email"], "is invalid");
        assert_eq!(err.field_errors()["phone"], "too short; not numeric");
    }

    #[test]
    fn from_response_tolerates_non_envelope_bodies() {
        let err = ApiError::from_response(503, &Value::Null);
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert!(err.message().is_none());
        assert!(err.field_errors().is_empty());
    }

    #[test]
    fn display_includes_kind_status_and_message() {
        let err = ApiError::from_response(409, &json!({ "message": "email taken" }));
        assert_eq!(err.to_string(), "conflict (409): email taken");
        let net = ApiError::network("connection refused");
        assert_eq!(net.to_string(), "network unreachable: connection refused");
        assert!(net.is_network());
    }
}

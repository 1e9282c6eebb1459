//! Outermost pipeline layer: every failure that survives refresh and retry is turned into a
//! user-facing notification, then handed back to the caller unchanged.

use crate::config::AuthEndpoints;
use crate::notify::{Notification, NotificationSink, Severity};
use crate::request::{ApiRequest, ApiResponse};
use crate::{ApiError, ErrorKind};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

const VALIDATION_DURATION: Duration = Duration::from_secs(10);

/// The notification to show for `err`, or `None` when the failure is expected and silent.
pub fn notification_for(err: &ApiError, req: &ApiRequest, auth: &AuthEndpoints) -> Option<Notification> {
    let server_message = err.message().filter(|m| !m.trim().is_empty());
    let (severity, title, message) = match err.kind() {
        ErrorKind::NetworkUnreachable => (
            Severity::Error,
            "Connection Failed",
            "Unable to connect to the server. Please check your internet connection.".to_owned(),
        ),
        ErrorKind::Unauthorized if auth.is_credential_exchange(&req.path) => (
            Severity::Error,
            "Authentication Failed",
            server_message.unwrap_or("Invalid email or password.").to_owned(),
        ),
        ErrorKind::Unauthorized => (
            Severity::Warning,
            "Session Expired",
            "Your session has expired. Please log in again.".to_owned(),
        ),
        ErrorKind::Forbidden => (
            Severity::Error,
            "Access Denied",
            "You do not have permission to perform this action.".to_owned(),
        ),
        ErrorKind::NotFound if req.options.silent_not_found => return None,
        ErrorKind::NotFound => {
            (Severity::Error, "Not Found", "The requested resource was not found.".to_owned())
        }
        ErrorKind::Conflict => (
            Severity::Warning,
            "Conflict",
            server_message.unwrap_or("A conflict occurred.").to_owned(),
        ),
        ErrorKind::ValidationFailed => {
            let fields = err.field_errors();
            if fields.is_empty() {
                let message = server_message.unwrap_or("Validation failed. Please check your input.");
                (Severity::Error, "Validation Failed", message.to_owned())
            } else {
                let joined =
                    fields.iter().map(|(field, msg)| format!("{field}: {msg}")).collect::<Vec<_>>().join(", ");
                return Some(
                    Notification::new(Severity::Error, joined)
                        .with_title("Validation Failed")
                        .with_duration(VALIDATION_DURATION),
                );
            }
        }
        ErrorKind::ServerError if err.status() == Some(503) => (
            Severity::Error,
            "Service Unavailable",
            "The service is temporarily unavailable. Please try again later.".to_owned(),
        ),
        ErrorKind::ServerError => (
            Severity::Error,
            "Server Error",
            "An internal server error occurred. Our team has been notified.".to_owned(),
        ),
        ErrorKind::Unknown => (
            Severity::Error,
            "Error",
            server_message.unwrap_or("An unexpected error occurred.").to_owned(),
        ),
    };
    Some(Notification::new(severity, message).with_title(title))
}

#[derive(Debug, Clone)]
pub struct ErrorReportLayer {
    sink: Arc<dyn NotificationSink>,
    auth: Arc<AuthEndpoints>,
}

impl ErrorReportLayer {
    pub fn new(sink: Arc<dyn NotificationSink>, auth: AuthEndpoints) -> Self {
        Self { sink, auth: Arc::new(auth) }
    }
}

impl<S> Layer<S> for ErrorReportLayer {
    type Service = ErrorReportService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorReportService { inner, sink: Arc::clone(&self.sink), auth: Arc::clone(&self.auth) }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorReportService<S> {
    inner: S,
    sink: Arc<dyn NotificationSink>,
    auth: Arc<AuthEndpoints>,
}

impl<S> Service<ApiRequest> for ErrorReportService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ApiError>,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = BoxFuture<'static, Result<ApiResponse, ApiError>>;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), ApiError>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let sink = Arc::clone(&self.sink);
        let auth = Arc::clone(&self.auth);
        let summary = ApiRequest { body: None, ..req.clone() };
        let fut = self.inner.call(req);
        Box::pin(async move {
            let err = match fut.await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            let (method, path) = (summary.method, summary.path.as_str());
            match notification_for(&err, &summary, &auth) {
                Some(notification) => {
                    if notification.severity == Severity::Warning {
                        tracing::warn!(%method, path, error = %err, "request failed");
                    } else {
                        tracing::error!(%method, path, error = %err, "request failed");
                    }
                    sink.notify(notification);
                }
                None => tracing::debug!(%method, path, error = %err, "request failed silently"),
            }
            Err(err)
        })
    }
}

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # vetcare-net
//!
//! Resilient client layer for the Vetcare clinic API.
//!
//! ## Features
//!
//! - **Token store** with pluggable persistence and JWT expiry decoding
//! - **Single-flight refresh**: concurrent 401s share one refresh call
//! - **Proactive refresh** ahead of access-token expiry
//! - **Retry policy** with exponential backoff, additive jitter and per-request overrides
//! - **Error notifications** mapped from HTTP status to user-facing messages
//! - **TTL cache** and observable resource stores with loading tracking
//! - **Keyed cancellation** of listeners that leaves shared loads running
//!
//! Requests flow through a tower stack, outermost first:
//!
//! ```text
//! ErrorReportLayer -> RetryLayer -> AuthLayer -> transport
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vetcare_net::{ApiClient, ClientConfig, Credentials, ResourceKind};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ApiClient::from_config(ClientConfig::default().with_env_overrides()?)?;
//!     client.login(&Credentials::new("vet@clinic.example", "secret")).await?;
//!     let _refresh = client.spawn_proactive_refresh();
//!
//!     let pets = client.collection::<Value>(ResourceKind::Pets);
//!     for pet in pets.list().await? {
//!         println!("{pet}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod cache;
pub mod cancel;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod loading;
pub mod notify;
pub mod refresh;
pub mod report;
pub mod request;
pub mod resource;
pub mod retry;
pub mod session;
pub mod sleeper;
pub mod store;
pub mod token;
#[cfg(feature = "reqwest-transport")]
pub mod transport;

// Re-exports
pub use auth::{AuthLayer, AuthService};
pub use backoff::Backoff;
pub use cache::{CachePolicy, TtlCache};
pub use cancel::{CancellationRegistry, Cancelled};
pub use client::{ApiClient, ApiClientBuilder, ClientContext, Pipeline};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthEndpoints, CacheTtls, ClientConfig, ConfigError};
pub use error::{ApiError, ErrorKind};
pub use jitter::Jitter;
pub use loading::{LoadingGuard, LoadingRegistry};
pub use notify::{Notification, NotificationCenter, NotificationSink, Severity, TracingSink};
pub use refresh::{
    AuthStatus, LogoutReason, ProactiveRefresh, RefreshCoordinator, RefreshPhase, Refresher,
    TransportRefresher,
};
pub use report::{notification_for, ErrorReportLayer, ErrorReportService};
pub use request::{ApiRequest, ApiResponse, Envelope, Method, RequestOptions, RetryOverride};
pub use resource::{Collection, CollectionRegistry, ResourceKind, Volatility};
pub use retry::{RetryConfig, RetryDecision, RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService};
pub use session::{Credentials, Registration, TokenGrant, User};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{FetchHandle, Invalidate, ResourceStore, StoreState};
pub use token::{EphemeralStorage, FileStorage, MemoryStorage, TokenStorage, TokenStore};
#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;

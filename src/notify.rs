//! User-facing notifications.
//!
//! The pipeline reports every surfaced failure to a [`NotificationSink`]. Two sinks ship with the
//! crate:
//!
//! - [`TracingSink`] only logs. It is the default, for hosts without a UI.
//! - [`NotificationCenter`] keeps the list of active notifications observable through a
//!   `tokio::sync::watch` channel and auto-dismisses them after their duration, which is what a
//!   toast area renders from.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// How serious a notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// How long a notification of this severity stays up unless told otherwise.
    pub fn default_duration(self) -> Duration {
        match self {
            Severity::Success | Severity::Info => Duration::from_millis(5_000),
            Severity::Warning => Duration::from_millis(6_000),
            Severity::Error => Duration::from_millis(8_000),
        }
    }

    pub fn default_title(self) -> &'static str {
        match self {
            Severity::Success => "Success",
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Success => "success",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    /// `None` keeps the notification until it is dismissed.
    pub duration: Option<Duration>,
    pub dismissible: bool,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            title: severity.default_title().to_owned(),
            message: message.into(),
            duration: Some(severity.default_duration()),
            dismissible: true,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Stay up until dismissed.
    pub fn sticky(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn non_dismissible(mut self) -> Self {
        self.dismissible = false;
        self
    }
}

/// Destination for user-facing messages.
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Surface `notification`; returns its id.
    fn notify(&self, notification: Notification) -> Uuid;
}

/// Sink that writes notifications to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) -> Uuid {
        match n.severity {
            Severity::Error => tracing::error!(title = %n.title, message = %n.message, "notification"),
            Severity::Warning => tracing::warn!(title = %n.title, message = %n.message, "notification"),
            Severity::Info | Severity::Success => {
                tracing::info!(title = %n.title, message = %n.message, "notification")
            }
        }
        n.id
    }
}

/// Observable list of active notifications. Clones share the same list.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    active: Arc<watch::Sender<Vec<Notification>>>,
    auto_dismiss: bool,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationCenter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { active: Arc::new(tx), auto_dismiss: true }
    }

    /// Keep notifications until dismissed explicitly, regardless of their duration.
    pub fn without_auto_dismiss(mut self) -> Self {
        self.auto_dismiss = false;
        self
    }

    pub fn show(&self, notification: Notification) -> Uuid {
        let id = notification.id;
        let duration = notification.duration.filter(|d| !d.is_zero());
        self.active.send_modify(|list| list.push(notification));

        if let (true, Some(after)) = (self.auto_dismiss, duration) {
            // Outside a runtime there is nothing to drive the timer; the entry stays until dismissed.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let active = Arc::clone(&self.active);
                handle.spawn(async move {
                    tokio::time::sleep(after).await;
                    active.send_if_modified(|list| remove_by_id(list, id));
                });
            }
        }
        id
    }

    pub fn success(&self, message: impl Into<String>) -> Uuid {
        self.show(Notification::new(Severity::Success, message))
    }

    pub fn info(&self, message: impl Into<String>) -> Uuid {
        self.show(Notification::new(Severity::Info, message))
    }

    pub fn warning(&self, message: impl Into<String>) -> Uuid {
        self.show(Notification::new(Severity::Warning, message))
    }

    pub fn error(&self, message: impl Into<String>) -> Uuid {
        self.show(Notification::new(Severity::Error, message))
    }

    /// Sticky, non-dismissible progress message. Dismiss it by id when the work is done.
    pub fn loading(&self, message: impl Into<String>) -> Uuid {
        self.show(Notification::new(Severity::Info, message).sticky().non_dismissible())
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        self.active.send_if_modified(|list| remove_by_id(list, id))
    }

    pub fn dismiss_all(&self) {
        self.active.send_if_modified(|list| {
            let had_any = !list.is_empty();
            list.clear();
            had_any
        });
    }

    pub fn active(&self) -> Vec<Notification> {
        self.active.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn has_notifications(&self) -> bool {
        !self.active.borrow().is_empty()
    }

    /// Observe the active list. Dropping the receiver only detaches this observer.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.active.subscribe()
    }
}

impl NotificationSink for NotificationCenter {
    fn notify(&self, notification: Notification) -> Uuid {
        tracing::debug!(severity = %notification.severity, title = %notification.title, "notification");
        self.show(notification)
    }
}

fn remove_by_id(list: &mut Vec<Notification>, id: Uuid) -> bool {
    let before = list.len();
    list.retain(|n| n.id != id);
    list.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_defaults() {
        assert_eq!(Severity::Error.default_duration(), Duration::from_secs(8));
        assert_eq!(Severity::Warning.default_duration(), Duration::from_secs(6));
        assert_eq!(Severity::Info.default_duration(), Duration::from_secs(5));
        assert_eq!(Severity::Success.default_title(), "Success");
    }

    #[test]
    fn center_tracks_and_dismisses_without_runtime() {
        let center = NotificationCenter::new();
        let a = center.error("boom");
        let _b = center.info("fyi");
        assert_eq!(center.count(), 2);
        assert!(center.dismiss(a));
        assert!(!center.dismiss(a));
        assert_eq!(center.active()[0].message, "fyi");
        center.dismiss_all();
        assert!(!center.has_notifications());
    }

    #[tokio::test(start_paused = true)]
    async fn center_auto_dismisses_after_duration() {
        let center = NotificationCenter::new();
        center.warning("slow down");
        center.loading("saving...");
        assert_eq!(center.count(), 2);

        tokio::time::sleep(Duration::from_millis(6_100)).await;

        let remaining = center.active();
        assert_eq!(remaining.len(), 1, "sticky loading notification stays");
        assert_eq!(remaining[0].message, "saving...");
        assert!(!remaining[0].dismissible);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let center = NotificationCenter::new().without_auto_dismiss();
        let mut rx = center.subscribe();
        center.success("saved");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }
}

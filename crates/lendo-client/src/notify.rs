//! User-facing status messages.
//!
//! One notification is visible at a time. A new one replaces the current one
//! and each expires on its own timer, which only clears the slot if it still
//! holds the same notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;

use lendo_core::{Notification, Severity};

use crate::config::NotificationConfig;

#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<Inner>,
}

struct Inner {
    current: watch::Sender<Option<Notification>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl NotificationCenter {
    pub fn new(ttl: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                current,
                next_id: AtomicU64::new(1),
                ttl,
            }),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(Duration::from_secs(config.expiry_secs))
    }

    /// Show a message, replacing whatever is visible. Returns the notification id.
    pub fn notify(&self, message: impl Into<String>, severity: Severity) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ttl = chrono::Duration::milliseconds(self.inner.ttl.as_millis() as i64);
        let notification = Notification::new(id, message, severity, ttl);

        tracing::debug!(
            id = id,
            severity = %severity,
            message = %notification.message,
            "Notification"
        );
        self.inner.current.send_replace(Some(notification));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::downgrade(&self.inner);
                let ttl = self.inner.ttl;
                handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    expire(inner, id);
                });
            }
            Err(_) => tracing::warn!(id = id, "No runtime, notification will not expire"),
        }

        id
    }

    pub fn info(&self, message: impl Into<String>) -> u64 {
        self.notify(message, Severity::Info)
    }

    pub fn success(&self, message: impl Into<String>) -> u64 {
        self.notify(message, Severity::Success)
    }

    pub fn error(&self, message: impl Into<String>) -> u64 {
        self.notify(message, Severity::Error)
    }

    pub fn current(&self) -> Option<Notification> {
        self.inner.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Notification>> {
        self.inner.current.subscribe()
    }

    pub fn dismiss(&self) {
        self.inner.current.send_if_modified(|current| current.take().is_some());
    }
}

fn expire(inner: Weak<Inner>, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.current.send_if_modified(|current| {
        if current.as_ref().map(|n| n.id) == Some(id) {
            *current = None;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notification_expires() {
        let center = NotificationCenter::new(Duration::from_secs(5));
        center.success("Deposit successful!");
        assert_eq!(center.current().unwrap().severity, Severity::Success);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(center.current().is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(center.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_notification_preempts() {
        let center = NotificationCenter::new(Duration::from_secs(5));
        center.info("Transaction submitted, waiting for confirmation...");

        tokio::time::sleep(Duration::from_secs(3)).await;
        let id = center.error("Insufficient repayment amount");

        // The first timer fires here and must leave the newer message alone
        tokio::time::sleep(Duration::from_secs(3)).await;
        let current = center.current().unwrap();
        assert_eq!(current.id, id);
        assert_eq!(current.message, "Insufficient repayment amount");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(center.current().is_none());
    }

    #[tokio::test]
    async fn test_watchers_see_updates() {
        let center = NotificationCenter::new(Duration::from_secs(5));
        let mut rx = center.watch();
        center.info("Account changed");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().message, "Account changed");

        center.dismiss();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}

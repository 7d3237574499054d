// Push notifications for terminal task outcomes. Delivery is fire-and-forget:
// a failed push is logged and never touches task state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

// Used when no push endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        debug!(title = %notification.title, "Push endpoint not configured, skipping notification");
        Ok(())
    }
}

/// Publishes to an ntfy topic URL.
pub struct NtfyNotifier {
    url: String,
    client: Client,
}

impl NtfyNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Title", notification.title.as_bytes())
            .header("Priority", "high")
            .header("Tags", "tada")
            .body(notification.message.clone())
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;

        response
            .error_for_status()
            .map_err(|e| Error::Notification(e.to_string()))?;

        info!(title = %notification.title, "Push notification sent");
        Ok(())
    }
}

pub fn from_endpoint(url: Option<&str>) -> Arc<dyn Notifier> {
    match url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Arc::new(NtfyNotifier::new(url)),
        None => Arc::new(DisabledNotifier),
    }
}

/// Sends in the background on `tracker`; the caller never sees the result.
pub fn notify_detached(
    notifier: &Arc<dyn Notifier>,
    tracker: &TaskTracker,
    notification: Notification,
) {
    if !notifier.is_enabled() {
        return;
    }

    let notifier = Arc::clone(notifier);
    tracker.spawn(async move {
        if let Err(e) = notifier.send(&notification).await {
            warn!(title = %notification.title, error = %e, "Failed to send push notification");
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    // Records everything it is asked to send.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn is_enabled(&self) -> bool {
            true
        }

        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().push(notification.clone());
            if self.fail {
                return Err(Error::Notification("endpoint down".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn test_missing_endpoint_disables_notifications() {
        assert!(!from_endpoint(None).is_enabled());
        assert!(!from_endpoint(Some("  ")).is_enabled());
        assert!(from_endpoint(Some("https://ntfy.sh/trains")).is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_noop() {
        tokio_test::assert_ok!(DisabledNotifier.send(&Notification::new("t", "m")).await);
    }

    #[tokio::test]
    async fn test_detached_delivery_swallows_failures() {
        let recorder = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let notifier: Arc<dyn Notifier> = recorder.clone();
        let tracker = TaskTracker::new();

        notify_detached(
            &notifier,
            &tracker,
            Notification::new("[KTX] 예약 성공!", "서울->부산 0900"),
        );

        tracker.close();
        tracker.wait().await;
        assert_eq!(recorder.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_notifier_spawns_nothing() {
        let notifier: Arc<dyn Notifier> = Arc::new(DisabledNotifier);
        let tracker = TaskTracker::new();

        notify_detached(&notifier, &tracker, Notification::new("t", "m"));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_notification_error() {
        let notifier = NtfyNotifier::new("http://127.0.0.1:9/topic");
        let err = notifier
            .send(&Notification::new("title", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Notification(_)));
    }
}

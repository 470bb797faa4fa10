//! Local push gate: de-duplication and self-echo suppression
//!
//! One server-side notification can arrive more than once (realtime
//! redelivery, a poll racing the feed). The gate keeps a short-lived set of
//! fingerprints and drops repeats inside the TTL. It also drops
//! notifications raised by this device and the `"test"` marker type.

use crate::device::{DeviceInfo, LocalNotification, LocalNotifier, resolve_device_id};
use crate::error::ClientResult;
use dashmap::DashMap;
use serde_json::{Value, json};
use shared::models::{NOTIFICATION_TYPE_TEST, Notification};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// What the gate did with a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Handed to the local notifier
    Shown,
    /// Same fingerprint seen within the TTL
    Duplicate,
    /// Raised by this device
    SameDevice,
    /// `"test"` notification type
    TestNotification,
}

impl GateDecision {
    pub fn is_shown(&self) -> bool {
        matches!(self, GateDecision::Shown)
    }
}

#[derive(Debug)]
pub struct NotificationGate {
    device_id: OnceLock<String>,
    recent: Arc<DashMap<String, Instant>>,
    ttl: Duration,
    notifier: Arc<dyn LocalNotifier>,
}

impl NotificationGate {
    pub fn new(ttl: Duration, notifier: Arc<dyn LocalNotifier>) -> Self {
        Self {
            device_id: OnceLock::new(),
            recent: Arc::new(DashMap::new()),
            ttl,
            notifier,
        }
    }

    /// Resolve and pin this device's id; later calls keep the first value
    pub fn register_device(&self, info: &DeviceInfo) -> &str {
        self.device_id.get_or_init(|| {
            let id = resolve_device_id(info);
            tracing::info!(device_id = %id, "Notification device registered");
            id
        })
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.get().map(String::as_str)
    }

    /// Fingerprint over title, body and serialized metadata
    pub fn fingerprint(title: &str, body: &str, data: &Value) -> String {
        json!([title, body, data]).to_string()
    }

    /// Suppression rules that do not depend on history
    pub fn screen(&self, notification: &Notification) -> Option<GateDecision> {
        if notification.kind == NOTIFICATION_TYPE_TEST {
            return Some(GateDecision::TestNotification);
        }
        match (self.device_id(), notification.device_id.as_deref()) {
            (Some(local), Some(origin)) if local == origin => Some(GateDecision::SameDevice),
            _ => None,
        }
    }

    /// Claim a fingerprint; `false` if it is still live
    fn claim(&self, key: String) -> bool {
        let now = Instant::now();
        let mut fresh = false;
        self.recent
            .entry(key.clone())
            .and_modify(|seen| {
                if now.duration_since(*seen) >= self.ttl {
                    *seen = now;
                    fresh = true;
                }
            })
            .or_insert_with(|| {
                fresh = true;
                now
            });
        if !fresh {
            return false;
        }

        let recent = self.recent.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            recent.remove_if(&key, |_, seen| seen.elapsed() >= ttl);
        });
        true
    }

    /// Schedule a local push unless suppressed or recently sent
    pub async fn send_local(&self, notification: LocalNotification) -> ClientResult<GateDecision> {
        let key = Self::fingerprint(&notification.title, &notification.body, &notification.data);
        if !self.claim(key) {
            tracing::debug!(title = %notification.title, "Duplicate local notification dropped");
            return Ok(GateDecision::Duplicate);
        }
        self.notifier.schedule(notification).await?;
        Ok(GateDecision::Shown)
    }

    /// Present a notification row received from the change feed
    pub async fn present(&self, notification: &Notification) -> ClientResult<GateDecision> {
        if let Some(decision) = self.screen(notification) {
            tracing::debug!(
                notification_id = %notification.id,
                decision = ?decision,
                "Local notification suppressed"
            );
            return Ok(decision);
        }
        self.send_local(LocalNotification {
            title: notification.title.clone(),
            body: notification.message.clone(),
            data: json!({
                "notificationId": notification.id,
                "type": notification.kind,
            }),
        })
        .await
    }

    /// Live fingerprints
    pub fn pending(&self) -> usize {
        self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<LocalNotification>>);

    #[async_trait]
    impl LocalNotifier for Recorder {
        async fn schedule(&self, notification: LocalNotification) -> ClientResult<()> {
            self.0.lock().push(notification);
            Ok(())
        }
    }

    fn notification(id: &str, device: Option<&str>, kind: &str) -> Notification {
        Notification {
            id: id.into(),
            branch_id: "b1".into(),
            title: "Order Ready".into(),
            message: "Order #7 for table 3 is ready for pickup!".into(),
            kind: kind.into(),
            order_id: Some("o1".into()),
            is_read: false,
            created_at: Utc::now(),
            expires_at: None,
            device_id: device.map(str::to_string),
        }
    }

    fn gate(recorder: &Arc<Recorder>) -> NotificationGate {
        NotificationGate::new(Duration::from_millis(5000), recorder.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_ttl_shown_once() {
        let recorder = Arc::new(Recorder::default());
        let gate = gate(&recorder);
        let n = notification("n1", None, "order");

        assert_eq!(gate.present(&n).await.unwrap(), GateDecision::Shown);
        assert_eq!(gate.present(&n).await.unwrap(), GateDecision::Duplicate);
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_expires_after_ttl() {
        let recorder = Arc::new(Recorder::default());
        let gate = gate(&recorder);
        let n = notification("n1", None, "order");

        gate.present(&n).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5001)).await;
        tokio::task::yield_now().await;
        assert_eq!(gate.pending(), 0);

        assert_eq!(gate.present(&n).await.unwrap(), GateDecision::Shown);
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_device_suppressed() {
        let recorder = Arc::new(Recorder::default());
        let gate = gate(&recorder);
        gate.register_device(&DeviceInfo::new(Some("till-1".into()), None));

        let mine = notification("n1", Some("till-1"), "order");
        assert_eq!(gate.present(&mine).await.unwrap(), GateDecision::SameDevice);

        let other = notification("n2", Some("till-2"), "order");
        assert_eq!(gate.present(&other).await.unwrap(), GateDecision::Shown);
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_test_type_suppressed() {
        let recorder = Arc::new(Recorder::default());
        let gate = gate(&recorder);
        let n = notification("n1", None, NOTIFICATION_TYPE_TEST);
        assert_eq!(gate.present(&n).await.unwrap(), GateDecision::TestNotification);
        assert!(recorder.0.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_device_shows_everything() {
        let recorder = Arc::new(Recorder::default());
        let gate = gate(&recorder);
        let n = notification("n1", Some("unknown"), "order");
        assert!(gate.present(&n).await.unwrap().is_shown());
    }

    #[test]
    fn test_register_device_is_sticky() {
        let gate = NotificationGate::new(Duration::from_secs(5), Arc::new(Recorder::default()));
        assert_eq!(gate.register_device(&DeviceInfo::new(Some("a".into()), None)), "a");
        assert_eq!(gate.register_device(&DeviceInfo::new(Some("b".into()), None)), "a");
        assert_eq!(gate.device_id(), Some("a"));
    }
}

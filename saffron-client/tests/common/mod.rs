// saffron-client/tests/common/mod.rs
// Shared fixtures for the scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use saffron_client::{
    AppState, BranchName, ClientConfig, ClientResult, DeviceInfo, Haptic, HapticFeedback, LocalNotification,
    LocalNotifier, MemoryBackend, Platform,
};
use serde_json::{Value, json};
use shared::message::{ChangeEvent, ChangeKind, Table};
use std::sync::Arc;
use std::time::Duration;

pub const CARDIFF: &str = "branch-cardiff";
pub const WEMBLEY: &str = "branch-wembley";
pub const CARDIFF_EMAIL: &str = "cardiff@saffron.test";
pub const WEMBLEY_EMAIL: &str = "wembley@saffron.test";
pub const PASSWORD: &str = "secret";
pub const THIS_DEVICE: &str = "till-1";

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<LocalNotification>>,
}

#[async_trait]
impl LocalNotifier for RecordingNotifier {
    async fn schedule(&self, notification: LocalNotification) -> ClientResult<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.sent.lock().iter().map(|n| n.title.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct RecordingHaptics {
    pub events: Mutex<Vec<Haptic>>,
}

impl HapticFeedback for RecordingHaptics {
    fn trigger(&self, kind: Haptic) {
        self.events.lock().push(kind);
    }
}

impl RecordingHaptics {
    pub fn count(&self, kind: Haptic) -> usize {
        self.events.lock().iter().filter(|k| **k == kind).count()
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub app: Arc<AppState>,
    pub notifier: Arc<RecordingNotifier>,
    pub haptics: Arc<RecordingHaptics>,
}

/// Two branches, one active staff member each, a small menu
pub fn seeded_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .seed(
            Table::Branches,
            vec![
                json!({"id": CARDIFF, "name": "Cardiff"}),
                json!({"id": WEMBLEY, "name": "Wembley"}),
            ],
        )
        .unwrap();
    backend.add_user(CARDIFF_EMAIL, PASSWORD, "user-cardiff");
    backend.add_user(WEMBLEY_EMAIL, PASSWORD, "user-wembley");
    backend
        .seed(
            Table::BranchUsers,
            vec![
                json!({"id": "user-cardiff", "branch_id": CARDIFF, "full_name": "Asha", "role": "staff", "is_active": true}),
                json!({"id": "user-wembley", "branch_id": WEMBLEY, "role": "manager", "is_active": true}),
            ],
        )
        .unwrap();
    backend
        .seed(
            Table::MenuCategories,
            vec![json!({"id": "cat-mains", "name": "Mains", "display_order": 1, "is_active": true})],
        )
        .unwrap();
    backend
        .seed(
            Table::MenuItems,
            vec![
                json!({"id": "X", "name": "Lamb Rogan Josh", "description": "Kashmiri chilli", "price": 5.0,
                       "category_id": "cat-mains", "is_available": true, "display_order": 1}),
                json!({"id": "Y", "name": "Dal Makhani", "description": "Black lentils", "price": 7.25,
                       "category_id": "cat-mains", "is_available": true, "is_vegetarian": true, "display_order": 2}),
            ],
        )
        .unwrap();
    backend
}

pub async fn harness() -> Harness {
    harness_with(seeded_backend()).await
}

pub async fn harness_with(backend: Arc<MemoryBackend>) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let haptics = Arc::new(RecordingHaptics::default());
    let platform = Platform::new(
        DeviceInfo::new(Some(THIS_DEVICE.into()), Some("Kitchen iPad".into())),
        notifier.clone(),
        haptics.clone(),
    );
    let config = ClientConfig::default()
        .with_dedup_ttl(Duration::from_millis(5000))
        .with_profile_retry(3, Duration::from_millis(10));
    let app = Arc::new(AppState::new(config, backend.clone(), platform));
    app.start().await.unwrap();
    Harness {
        backend,
        app,
        notifier,
        haptics,
    }
}

impl Harness {
    pub async fn sign_in_cardiff(&self) {
        self.app
            .sign_in(CARDIFF_EMAIL, PASSWORD, BranchName::Cardiff)
            .await
            .unwrap();
    }
}

/// Notification insert as another client would cause it
pub fn notification_insert(id: &str, branch_id: &str, title: &str, device_id: Option<&str>, kind: &str) -> ChangeEvent {
    let row = json!({
        "id": id,
        "branch_id": branch_id,
        "title": title,
        "message": format!("{title} message"),
        "type": kind,
        "order_id": Value::Null,
        "is_read": false,
        "created_at": "2024-05-01T10:00:00Z",
        "expires_at": Value::Null,
        "device_id": device_id,
    });
    ChangeEvent::new(ChangeKind::Insert, Table::Notifications, Some(row), None)
}

/// Poll `cond` until it holds or five seconds pass
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

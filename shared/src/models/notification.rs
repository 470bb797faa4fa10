//! Notification model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification type used for order lifecycle events
pub const NOTIFICATION_TYPE_ORDER: &str = "order";
/// Marker type for test pushes, never shown locally
pub const NOTIFICATION_TYPE_TEST: &str = "test";

/// Notification row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub branch_id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Insert payload for a notification row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub branch_id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub order_id: Option<String>,
    pub is_read: bool,
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_field_rename() {
        let row: Notification = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "branch_id": "b1",
            "title": "Order Ready",
            "message": "Order #7 for table 4 is ready for pickup!",
            "type": "order",
            "order_id": "o1",
            "is_read": false,
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(row.kind, NOTIFICATION_TYPE_ORDER);
        assert!(row.device_id.is_none());

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "order");
    }
}

//! Order models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order lifecycle status (backend enum `order_status`)
///
/// Strictly forward: `New -> Preparing -> Ready`. `Ready` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Preparing,
    Ready,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 3] = [OrderStatus::New, OrderStatus::Preparing, OrderStatus::Ready];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "New",
            OrderStatus::Preparing => "Preparing",
            OrderStatus::Ready => "Ready",
        }
    }

    /// The status the kitchen moves to next, `None` once ready
    pub fn next(&self) -> Option<OrderStatus> {
        match self {
            OrderStatus::New => Some(OrderStatus::Preparing),
            OrderStatus::Preparing => Some(OrderStatus::Ready),
            OrderStatus::Ready => None,
        }
    }

    /// Whether `target` is strictly ahead of `self`.
    ///
    /// `New -> Ready` is accepted; only backward and same-state moves are not.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        target > *self
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Order row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub branch_id: String,
    pub table_number: String,
    pub status: OrderStatus,
    pub total_amount: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
}

/// Order line row, owned by its order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub menu_item_id: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub total_price: f64,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

/// Order line input for [`CreateOrderRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub menu_item_id: String,
    pub quantity: i32,
    /// Price captured when the line was added to the cart
    pub unit_price: f64,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

/// Input for creating an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub table_number: String,
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Order as shown in list views: the row plus its line count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    #[serde(flatten)]
    pub order: Order,
    pub item_count: usize,
}

/// Order line with the menu item it refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    #[serde(flatten)]
    pub item: OrderItem,
    #[serde(default)]
    pub menu_item_name: Option<String>,
    #[serde(default)]
    pub menu_item_description: Option<String>,
}

/// Order with its lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: Order,
    pub items: Vec<OrderLine>,
}

/// Dashboard counters over the last 24 hours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStats {
    pub total: usize,
    pub new: usize,
    pub preparing: usize,
    pub ready: usize,
}

impl OrderStats {
    pub fn record(&mut self, status: OrderStatus) {
        self.total += 1;
        match status {
            OrderStatus::New => self.new += 1,
            OrderStatus::Preparing => self.preparing += 1,
            OrderStatus::Ready => self.ready += 1,
        }
    }
}

impl FromIterator<OrderStatus> for OrderStats {
    fn from_iter<I: IntoIterator<Item = OrderStatus>>(iter: I) -> Self {
        let mut stats = OrderStats::default();
        for status in iter {
            stats.record(status);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use OrderStatus::*;
        assert!(New.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Ready));
        assert!(New.can_transition_to(Ready));

        assert!(!New.can_transition_to(New));
        assert!(!Preparing.can_transition_to(New));
        assert!(!Ready.can_transition_to(Preparing));
        assert!(!Ready.can_transition_to(Ready));
    }

    #[test]
    fn test_next_and_terminal() {
        assert_eq!(OrderStatus::New.next(), Some(OrderStatus::Preparing));
        assert_eq!(OrderStatus::Preparing.next(), Some(OrderStatus::Ready));
        assert_eq!(OrderStatus::Ready.next(), None);
        assert!(OrderStatus::Ready.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
    }

    #[test]
    fn test_status_serde_matches_backend_enum() {
        assert_eq!(serde_json::to_string(&OrderStatus::Preparing).unwrap(), "\"Preparing\"");
        let st: OrderStatus = serde_json::from_str("\"Ready\"").unwrap();
        assert_eq!(st, OrderStatus::Ready);
        assert!(serde_json::from_str::<OrderStatus>("\"Served\"").is_err());
        assert_eq!("preparing".parse::<OrderStatus>(), Ok(OrderStatus::Preparing));
    }

    #[test]
    fn test_summary_flattens_order() {
        let json = serde_json::json!({
            "id": "o1",
            "order_number": "42",
            "branch_id": "b1",
            "table_number": "12",
            "status": "New",
            "total_amount": 10.0,
            "notes": null,
            "created_by": "u1",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z",
            "ready_at": null,
            "item_count": 3
        });
        let summary: OrderSummary = serde_json::from_value(json).unwrap();
        assert_eq!(summary.order.table_number, "12");
        assert_eq!(summary.item_count, 3);
    }

    #[test]
    fn test_stats_from_statuses() {
        use OrderStatus::*;
        let stats: OrderStats = [New, New, Preparing, Ready].into_iter().collect();
        assert_eq!(
            stats,
            OrderStats {
                total: 4,
                new: 2,
                preparing: 1,
                ready: 1
            }
        );
    }
}

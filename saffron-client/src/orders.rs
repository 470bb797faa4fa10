//! Order operations for the active branch
//!
//! Reads go through the query cache; writes invalidate it. Every write also
//! publishes a notification row, best effort: the order operation succeeds
//! even if that insert fails.

use crate::backend::{Backend, Query, decode_first, decode_rows};
use crate::cache::{Invalidation, QueryCache, QueryKey};
use crate::device::{Haptic, HapticFeedback};
use crate::error::{ClientError, ClientResult};
use crate::notifications::NotificationService;
use crate::session::SessionStore;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use shared::error::ErrorCode;
use shared::message::Table;
use shared::models::{
    CreateOrderRequest, MenuItem, NewOrderItem, Order, OrderDetail, OrderItem, OrderLine, OrderStats,
    OrderStatus, OrderSummary,
};
use shared::money;
use shared::util::{hours_ago, now_rfc3339};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Stats window
const STATS_WINDOW_HOURS: i64 = 24;

/// Order data is always refetched on read; the cache only serves `peek`
const ORDER_STALE_TIME: Duration = Duration::ZERO;

pub const NEW_ORDER_TITLE: &str = "New Order Received";

/// Notification title and message for a new order
pub fn new_order_notification(order: &Order) -> (&'static str, String) {
    (
        NEW_ORDER_TITLE,
        format!(
            "Order #{} for table {} has been placed.",
            order.order_number, order.table_number
        ),
    )
}

/// Notification for a status change; `New` has none
pub fn status_notification(order: &Order, status: OrderStatus) -> Option<(&'static str, String)> {
    match status {
        OrderStatus::New => None,
        OrderStatus::Preparing => Some((
            "Order Being Prepared",
            format!(
                "Order #{} for table {} is now being prepared.",
                order.order_number, order.table_number
            ),
        )),
        OrderStatus::Ready => Some((
            "Order Ready",
            format!(
                "Order #{} for table {} is ready for pickup!",
                order.order_number, order.table_number
            ),
        )),
    }
}

/// Reject requests the backend would store incorrectly
pub fn validate_request(request: &CreateOrderRequest) -> ClientResult<()> {
    if request.table_number.trim().is_empty() {
        return Err(ClientError::Validation(
            ErrorCode::TableNumberRequired,
            "Table number is required".into(),
        ));
    }
    if request.items.is_empty() {
        return Err(ClientError::Validation(
            ErrorCode::OrderEmpty,
            "Order must contain at least one item".into(),
        ));
    }
    for item in &request.items {
        if item.menu_item_id.trim().is_empty() {
            return Err(ClientError::Validation(
                ErrorCode::RequiredField,
                "Order item is missing its menu item".into(),
            ));
        }
        if item.quantity < 1 {
            return Err(ClientError::Validation(
                ErrorCode::InvalidOrderLine,
                format!("Quantity must be at least 1, got {}", item.quantity),
            ));
        }
        if !item.unit_price.is_finite() || item.unit_price < 0.0 {
            return Err(ClientError::Validation(
                ErrorCode::InvalidOrderLine,
                format!("Invalid unit price {}", item.unit_price),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StatusRow {
    status: OrderStatus,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderService {
    backend: Arc<dyn Backend>,
    session: Arc<SessionStore>,
    cache: Arc<QueryCache>,
    notifications: NotificationService,
    haptics: Arc<dyn HapticFeedback>,
}

impl OrderService {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: Arc<SessionStore>,
        cache: Arc<QueryCache>,
        notifications: NotificationService,
        haptics: Arc<dyn HapticFeedback>,
    ) -> Self {
        Self {
            backend,
            session,
            cache,
            notifications,
            haptics,
        }
    }

    // ========== Reads ==========

    /// Orders of the active branch, newest first, with their line counts
    pub async fn list_orders(&self, status: Option<OrderStatus>) -> ClientResult<Vec<OrderSummary>> {
        let branch_id = self.session.require_branch_id()?;
        let backend = self.backend.clone();
        self.cache
            .fetch(QueryKey::orders(&branch_id, status), ORDER_STALE_TIME, || async move {
                let mut query = Query::new().eq("branch_id", branch_id.as_str());
                if let Some(status) = status {
                    query = query.eq("status", status.as_str());
                }
                let orders: Vec<Order> =
                    decode_rows(backend.select(Table::Orders, &query.order("created_at", false)).await?)?;
                if orders.is_empty() {
                    return Ok(Vec::new());
                }

                let ids: Vec<&str> = orders.iter().map(|o| o.id.as_str()).collect();
                let refs: Vec<OrderRef> = decode_rows(
                    backend
                        .select(
                            Table::OrderItems,
                            &Query::new().columns("order_id").is_in("order_id", ids),
                        )
                        .await?,
                )?;
                let mut counts: HashMap<String, usize> = HashMap::new();
                for r in refs {
                    *counts.entry(r.order_id).or_default() += 1;
                }

                tracing::debug!(branch_id = %branch_id, count = orders.len(), "Fetched orders");
                Ok(orders
                    .into_iter()
                    .map(|order| {
                        let item_count = counts.get(&order.id).copied().unwrap_or(0);
                        OrderSummary { order, item_count }
                    })
                    .collect())
            })
            .await
    }

    /// One order of the active branch with its lines; an order without lines is not found
    pub async fn get_order(&self, order_id: &str) -> ClientResult<OrderDetail> {
        let branch_id = self.session.require_branch_id()?;
        let backend = self.backend.clone();
        let key = QueryKey::order(&branch_id, order_id);
        self.cache
            .fetch(key, ORDER_STALE_TIME, || async move {
                let order = fetch_order(backend.as_ref(), &branch_id, order_id)
                    .await?
                    .ok_or_else(|| {
                        ClientError::NotFound(ErrorCode::OrderNotFound, format!("Order {order_id} not found"))
                    })?;

                let items: Vec<OrderItem> = decode_rows(
                    backend
                        .select(Table::OrderItems, &Query::new().eq("order_id", order_id))
                        .await?,
                )?;
                if items.is_empty() {
                    return Err(ClientError::NotFound(
                        ErrorCode::OrderNotFound,
                        format!("Order {order_id} has no items"),
                    ));
                }
                let menu_ids: Vec<&str> = items.iter().map(|i| i.menu_item_id.as_str()).collect();
                let rows = backend
                    .select(Table::MenuItems, &Query::new().is_in("id", menu_ids))
                    .await?;
                let menu: HashMap<String, MenuItem> = decode_rows::<MenuItem>(rows)?
                    .into_iter()
                    .map(|m| (m.id.clone(), m))
                    .collect();

                let items = items
                    .into_iter()
                    .map(|item| {
                        let menu_item = menu.get(&item.menu_item_id);
                        OrderLine {
                            menu_item_name: menu_item.map(|m| m.name.clone()),
                            menu_item_description: menu_item
                                .map(|m| m.description.clone())
                                .filter(|d| !d.is_empty()),
                            item,
                        }
                    })
                    .collect();
                Ok(OrderDetail { order, items })
            })
            .await
    }

    /// Status counts over the last 24 hours
    pub async fn order_stats(&self) -> ClientResult<OrderStats> {
        let branch_id = self.session.require_branch_id()?;
        let backend = self.backend.clone();
        self.cache
            .fetch(QueryKey::order_stats(&branch_id), ORDER_STALE_TIME, || async move {
                let since = hours_ago(Utc::now(), STATS_WINDOW_HOURS).to_rfc3339_opts(SecondsFormat::Micros, true);
                let query = Query::new()
                    .columns("status,created_at")
                    .eq("branch_id", branch_id.as_str())
                    .gte("created_at", since);
                let rows: Vec<StatusRow> = decode_rows(backend.select(Table::Orders, &query).await?)?;
                Ok(rows.into_iter().map(|r| r.status).collect())
            })
            .await
    }

    // ========== Writes ==========

    /// Create an order with its lines, priced with the submitted unit prices
    pub async fn create_order(&self, request: CreateOrderRequest) -> ClientResult<Order> {
        let result = self.create_order_inner(request).await;
        self.feedback("create order", &result);
        result
    }

    async fn create_order_inner(&self, request: CreateOrderRequest) -> ClientResult<Order> {
        validate_request(&request)?;
        let branch_id = self.session.require_branch_id()?;
        let user_id = self.session.user_id().ok_or(ClientError::NotAuthenticated)?;

        let total = money::order_total(request.items.iter().map(|i| (i.quantity, i.unit_price)));
        let row = json!({
            "branch_id": branch_id,
            "table_number": request.table_number.trim(),
            "notes": request.notes,
            "created_by": user_id,
            "status": OrderStatus::New,
            "total_amount": total,
        });
        let order: Order = decode_first(self.backend.insert(Table::Orders, vec![row]).await?)?
            .ok_or_else(|| ClientError::Internal("order insert returned no row".into()))?;
        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            branch_id = %branch_id,
            total = total,
            "Order created"
        );

        let lines: Vec<Value> = request.items.iter().map(|item| line_row(&order.id, item)).collect();
        if let Err(e) = self.backend.insert(Table::OrderItems, lines).await {
            return Err(self.roll_back_order(&order, e).await);
        }

        let (title, message) = new_order_notification(&order);
        // Failure already logged
        let _ = self.notifications.publish_for_order(&order, title, message).await;

        self.cache.invalidate(&Invalidation::OrderLists { branch_id: branch_id.clone() });
        self.cache.invalidate(&Invalidation::OrderStats { branch_id });
        Ok(order)
    }

    /// Delete an order whose lines failed to insert
    async fn roll_back_order(&self, order: &Order, cause: ClientError) -> ClientError {
        tracing::error!(order_id = %order.id, "Order items insert failed, removing order: {cause}");
        let query = Query::new()
            .eq("id", order.id.as_str())
            .eq("branch_id", order.branch_id.as_str());
        match self.backend.delete(Table::Orders, &query).await {
            Ok(_) => cause,
            Err(e) => {
                tracing::error!(order_id = %order.id, "Order cleanup failed, order has no items: {e}");
                ClientError::PartialWrite {
                    order_id: order.id.clone(),
                }
            }
        }
    }

    /// Move an order forward; `ready_at` is set exactly when the target is `Ready`
    pub async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> ClientResult<Order> {
        let result = self.update_order_status_inner(order_id, status).await;
        self.feedback("update order status", &result);
        result
    }

    async fn update_order_status_inner(&self, order_id: &str, status: OrderStatus) -> ClientResult<Order> {
        let branch_id = self.session.require_branch_id()?;
        let current = fetch_order(self.backend.as_ref(), &branch_id, order_id)
            .await?
            .ok_or_else(|| {
                ClientError::NotFound(ErrorCode::OrderNotFound, format!("Order {order_id} not found"))
            })?;
        if !current.status.can_transition_to(status) {
            return Err(ClientError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let ready_at = match status {
            OrderStatus::Ready => Value::String(now_rfc3339()),
            _ => Value::Null,
        };
        // Guarded on the status just read so concurrent moves cannot both win
        let query = Query::new()
            .eq("id", order_id)
            .eq("branch_id", branch_id.as_str())
            .eq("status", current.status.as_str());
        let rows = self
            .backend
            .update(Table::Orders, json!({ "status": status, "ready_at": ready_at }), &query)
            .await?;
        let order: Order = decode_first(rows)?.ok_or_else(|| {
            ClientError::Conflict(format!("Order {order_id} changed while updating its status"))
        })?;
        tracing::info!(
            order_id = %order.id,
            from = %current.status,
            to = %status,
            "Order status updated"
        );

        if let Some((title, message)) = status_notification(&order, status) {
            let _ = self.notifications.publish_for_order(&order, title, message).await;
        }

        self.cache.invalidate(&Invalidation::OrderLists { branch_id: branch_id.clone() });
        self.cache.invalidate(&Invalidation::OrderDetail {
            branch_id: branch_id.clone(),
            order_id: order.id.clone(),
        });
        self.cache.invalidate(&Invalidation::OrderStats { branch_id });
        Ok(order)
    }

    fn feedback<T>(&self, what: &str, result: &ClientResult<T>) {
        match result {
            Ok(_) => self.haptics.trigger(Haptic::Success),
            Err(e) => {
                tracing::warn!(operation = what, code = %e.code(), "Order operation failed: {e}");
                self.haptics.trigger(Haptic::Error);
            }
        }
    }
}

async fn fetch_order(backend: &dyn Backend, branch_id: &str, order_id: &str) -> ClientResult<Option<Order>> {
    let query = Query::new()
        .eq("id", order_id)
        .eq("branch_id", branch_id)
        .limit(1);
    decode_first(backend.select(Table::Orders, &query).await?)
}

fn line_row(order_id: &str, item: &NewOrderItem) -> Value {
    json!({
        "order_id": order_id,
        "menu_item_id": item.menu_item_id,
        "quantity": item.quantity,
        "unit_price": item.unit_price,
        "total_price": money::to_f64(money::line_total(item.quantity, item.unit_price)),
        "special_instructions": item.special_instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(number: &str, table: &str) -> Order {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Order {
            id: "o1".into(),
            order_number: number.into(),
            branch_id: "b1".into(),
            table_number: table.into(),
            status: OrderStatus::New,
            total_amount: 10.0,
            notes: None,
            created_by: None,
            created_at: at,
            updated_at: at,
            ready_at: None,
        }
    }

    fn request(items: Vec<NewOrderItem>) -> CreateOrderRequest {
        CreateOrderRequest {
            table_number: "12".into(),
            items,
            notes: None,
        }
    }

    fn item(quantity: i32, unit_price: f64) -> NewOrderItem {
        NewOrderItem {
            menu_item_id: "m1".into(),
            quantity,
            unit_price,
            special_instructions: None,
        }
    }

    #[test]
    fn test_notification_copy() {
        let o = order("42", "7");
        assert_eq!(
            new_order_notification(&o),
            ("New Order Received", "Order #42 for table 7 has been placed.".to_string())
        );
        assert_eq!(
            status_notification(&o, OrderStatus::Preparing).unwrap().1,
            "Order #42 for table 7 is now being prepared."
        );
        assert_eq!(
            status_notification(&o, OrderStatus::Ready),
            Some(("Order Ready", "Order #42 for table 7 is ready for pickup!".to_string()))
        );
        assert!(status_notification(&o, OrderStatus::New).is_none());
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&request(vec![item(2, 5.0)])).is_ok());
        assert_eq!(
            validate_request(&request(vec![])).unwrap_err().code(),
            ErrorCode::OrderEmpty
        );
        assert_eq!(
            validate_request(&request(vec![item(0, 5.0)])).unwrap_err().code(),
            ErrorCode::InvalidOrderLine
        );
        assert!(validate_request(&request(vec![item(1, -1.0)])).is_err());
        assert!(validate_request(&request(vec![item(1, f64::NAN)])).is_err());

        let mut blank_table = request(vec![item(1, 1.0)]);
        blank_table.table_number = "  ".into();
        assert!(matches!(
            validate_request(&blank_table),
            Err(ClientError::Validation(ErrorCode::TableNumberRequired, _))
        ));
    }

    #[test]
    fn test_line_row_total() {
        let row = line_row("o1", &item(3, 4.35));
        assert_eq!(row["total_price"], json!(13.05));
        assert_eq!(row["order_id"], json!("o1"));
    }
}

// saffron-client/tests/order_lifecycle.rs
// Order creation, status transitions and branch scoping

mod common;

use common::*;
use saffron_client::{ClientError, CreateOrderRequest, Haptic, NewOrderItem, OrderStatus};
use serde_json::{Value, json};
use shared::message::Table;
use shared::money::money_eq;

fn line(menu_item_id: &str, quantity: i32, unit_price: f64) -> NewOrderItem {
    NewOrderItem {
        menu_item_id: menu_item_id.into(),
        quantity,
        unit_price,
        special_instructions: None,
    }
}

fn request(table: &str, items: Vec<NewOrderItem>) -> CreateOrderRequest {
    CreateOrderRequest {
        table_number: table.into(),
        items,
        notes: None,
    }
}

#[tokio::test]
async fn test_order_lifecycle_scenario() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let order = orders
        .create_order(request("12", vec![line("X", 2, 5.00)]))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert!(money_eq(order.total_amount, 10.00));
    assert_eq!(order.branch_id, CARDIFF);
    assert_eq!(order.created_by.as_deref(), Some("user-cardiff"));
    assert!(order.notes.is_none());
    assert!(order.ready_at.is_none());

    let preparing = orders
        .update_order_status(&order.id, OrderStatus::Preparing)
        .await
        .unwrap();
    assert_eq!(preparing.status, OrderStatus::Preparing);
    assert!(preparing.ready_at.is_none());

    let ready = orders
        .update_order_status(&order.id, OrderStatus::Ready)
        .await
        .unwrap();
    assert_eq!(ready.status, OrderStatus::Ready);
    let ready_at = ready.ready_at.expect("ready_at set");
    assert!(ready_at >= order.created_at);

    // sign-in, create and two updates
    assert_eq!(h.haptics.count(Haptic::Success), 4);
}

#[tokio::test]
async fn test_total_uses_submitted_prices() {
    let h = harness().await;
    h.sign_in_cardiff().await;

    // Menu says X costs 5.00 and Y 7.25; the submitted prices win
    let order = h
        .app
        .orders()
        .create_order(request("4", vec![line("X", 3, 4.35), line("Y", 1, 0.10)]))
        .await
        .unwrap();
    assert!(money_eq(order.total_amount, 13.15));

    let detail = h.app.orders().get_order(&order.id).await.unwrap();
    assert_eq!(detail.items.len(), 2);
    let x = detail.items.iter().find(|l| l.item.menu_item_id == "X").unwrap();
    assert!(money_eq(x.item.total_price, 13.05));
    assert_eq!(x.menu_item_name.as_deref(), Some("Lamb Rogan Josh"));
}

#[tokio::test]
async fn test_ready_at_only_for_ready() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let skip = orders.create_order(request("1", vec![line("X", 1, 5.0)])).await.unwrap();
    let ready = orders.update_order_status(&skip.id, OrderStatus::Ready).await.unwrap();
    assert!(ready.ready_at.is_some());

    let normal = orders.create_order(request("2", vec![line("X", 1, 5.0)])).await.unwrap();
    let preparing = orders.update_order_status(&normal.id, OrderStatus::Preparing).await.unwrap();
    assert!(preparing.ready_at.is_none());
}

#[tokio::test]
async fn test_backward_and_repeated_transitions_rejected() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let order = orders.create_order(request("9", vec![line("X", 1, 5.0)])).await.unwrap();
    let err = orders.update_order_status(&order.id, OrderStatus::New).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::InvalidTransition {
            from: OrderStatus::New,
            to: OrderStatus::New
        }
    ));

    orders.update_order_status(&order.id, OrderStatus::Ready).await.unwrap();
    let err = orders
        .update_order_status(&order.id, OrderStatus::Preparing)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidTransition { .. }));
    assert_eq!(h.haptics.count(Haptic::Error), 2);
}

#[tokio::test]
async fn test_branch_isolation() {
    let h = harness().await;
    h.backend
        .seed(
            Table::Orders,
            vec![
                json!({"id": "order-a", "branch_id": CARDIFF, "table_number": "5", "total_amount": 12.0}),
                json!({"id": "order-b", "branch_id": WEMBLEY, "table_number": "5", "total_amount": 8.0}),
            ],
        )
        .unwrap();
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let listed = orders.list_orders(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].order.id, "order-a");

    assert!(matches!(orders.get_order("order-b").await, Err(ClientError::NotFound(..))));
    assert!(matches!(
        orders.update_order_status("order-b", OrderStatus::Preparing).await,
        Err(ClientError::NotFound(..))
    ));
    let other = h.backend.rows(Table::Orders);
    let b = other.iter().find(|r| r["id"] == "order-b").unwrap();
    assert_eq!(b["status"], "New");
}

#[tokio::test]
async fn test_list_filters_status_and_counts_items() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let first = orders
        .create_order(request("1", vec![line("X", 1, 5.0), line("Y", 2, 7.25)]))
        .await
        .unwrap();
    let second = orders.create_order(request("2", vec![line("X", 1, 5.0)])).await.unwrap();
    orders.update_order_status(&first.id, OrderStatus::Preparing).await.unwrap();

    let all = orders.list_orders(None).await.unwrap();
    assert_eq!(all.len(), 2);
    let count_of = |id: &str| all.iter().find(|s| s.order.id == id).map(|s| s.item_count);
    assert_eq!(count_of(&first.id), Some(2));
    assert_eq!(count_of(&second.id), Some(1));

    let preparing = orders.list_orders(Some(OrderStatus::Preparing)).await.unwrap();
    assert_eq!(preparing.len(), 1);
    assert_eq!(preparing[0].order.id, first.id);

    let stats = orders.order_stats().await.unwrap();
    assert_eq!((stats.total, stats.new, stats.preparing, stats.ready), (2, 1, 1, 0));
}

#[tokio::test]
async fn test_failed_item_insert_removes_order() {
    let h = harness().await;
    h.sign_in_cardiff().await;

    h.backend.fail_next_insert(Table::OrderItems);
    let err = h
        .app
        .orders()
        .create_order(request("3", vec![line("X", 1, 5.0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { .. }));
    assert!(h.backend.rows(Table::Orders).is_empty());
    assert!(h.backend.rows(Table::Notifications).is_empty());
    assert_eq!(h.haptics.count(Haptic::Error), 1);
}

#[tokio::test]
async fn test_failed_cleanup_reports_partial_write() {
    let h = harness().await;
    h.sign_in_cardiff().await;

    h.backend.fail_next_insert(Table::OrderItems);
    h.backend.fail_next_delete(Table::Orders);
    let err = h
        .app
        .orders()
        .create_order(request("3", vec![line("X", 1, 5.0)]))
        .await
        .unwrap_err();

    let ClientError::PartialWrite { order_id } = &err else {
        panic!("expected partial write, got {err:?}");
    };
    let rows = h.backend.rows(Table::Orders);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], Value::String(order_id.clone()));
    assert!(h.backend.rows(Table::OrderItems).is_empty());
    assert_eq!(err.to_app_error().details.unwrap()["order_id"], json!(order_id));
    assert!(matches!(
        h.app.orders().get_order(order_id).await,
        Err(ClientError::NotFound(..))
    ));
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_order() {
    let h = harness().await;
    h.sign_in_cardiff().await;

    h.backend.fail_next_insert(Table::Notifications);
    let order = h
        .app
        .orders()
        .create_order(request("8", vec![line("X", 1, 5.0)]))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert!(h.backend.rows(Table::Notifications).is_empty());
    assert_eq!(h.backend.rows(Table::OrderItems).len(), 1);
}

#[tokio::test]
async fn test_order_notifications_carry_device_and_copy() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    let order = orders.create_order(request("12", vec![line("X", 2, 5.0)])).await.unwrap();
    orders.update_order_status(&order.id, OrderStatus::Preparing).await.unwrap();
    orders.update_order_status(&order.id, OrderStatus::Ready).await.unwrap();

    let rows = h.backend.rows(Table::Notifications);
    let messages: Vec<&str> = rows.iter().filter_map(|r| r["message"].as_str()).collect();
    let n = &order.order_number;
    assert_eq!(
        messages,
        vec![
            format!("Order #{n} for table 12 has been placed."),
            format!("Order #{n} for table 12 is now being prepared."),
            format!("Order #{n} for table 12 is ready for pickup!"),
        ]
    );
    assert!(rows.iter().all(|r| r["device_id"] == THIS_DEVICE && r["type"] == "order"));
    assert!(rows.iter().all(|r| r["order_id"] == Value::String(order.id.clone())));
}

#[tokio::test]
async fn test_invalid_requests_rejected_before_writing() {
    let h = harness().await;
    h.sign_in_cardiff().await;
    let orders = h.app.orders();

    assert!(matches!(
        orders.create_order(request(" ", vec![line("X", 1, 5.0)])).await,
        Err(ClientError::Validation(..))
    ));
    assert!(matches!(
        orders.create_order(request("1", vec![])).await,
        Err(ClientError::Validation(..))
    ));
    assert!(h.backend.rows(Table::Orders).is_empty());
}

#[tokio::test]
async fn test_operations_require_branch() {
    let h = harness().await;
    let err = h.app.orders().list_orders(None).await.unwrap_err();
    assert!(matches!(err, ClientError::NotAuthenticated));
}

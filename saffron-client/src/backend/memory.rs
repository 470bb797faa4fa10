//! In-process backend
//!
//! Tables of JSON rows with the same filter semantics as the hosted
//! backend, server-side defaults, password users, a broadcast change feed,
//! and failure injection for tests.

use super::{AuthEvent, AuthSession, AuthUser, Backend, CHANGE_STREAM_CAPACITY, ChangeStream, Query};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use shared::error::ErrorCode;
use shared::message::{ChangeEvent, ChangeFilter, ChangeKind, Table};
use shared::money;
use shared::util::now_rfc3339;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const FEED_CAPACITY: usize = 1024;
const AUTH_CAPACITY: usize = 64;
const SESSION_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone)]
struct MemoryUser {
    password: String,
    user: AuthUser,
}

/// Failure injection counters, consumed one call at a time
#[derive(Debug, Default)]
struct Failures {
    insert: HashMap<Table, u32>,
    select: HashMap<Table, u32>,
    delete: HashMap<Table, u32>,
    sign_out: bool,
}

impl Failures {
    fn take(counter: &mut HashMap<Table, u32>, table: Table) -> bool {
        match counter.get_mut(&table) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<Table, Vec<Value>>,
    users: HashMap<String, MemoryUser>,
    session: Option<AuthSession>,
    next_order_number: u64,
    token_seq: u64,
    failures: Failures,
}

impl MemoryState {
    fn issue_session(&mut self, user: AuthUser) -> AuthSession {
        self.token_seq += 1;
        AuthSession {
            access_token: format!("mem-access-{}", self.token_seq),
            refresh_token: format!("mem-refresh-{}", self.token_seq),
            expires_at: Some(chrono::Utc::now().timestamp() + SESSION_TTL_SECS),
            user,
        }
    }

    /// Fill server-side defaults and check constraints for one new row
    fn prepare_row(&mut self, table: Table, row: Value) -> ClientResult<Value> {
        let Value::Object(mut obj) = row else {
            return Err(ClientError::Validation(
                ErrorCode::InvalidRequest,
                format!("insert into {table} expects an object"),
            ));
        };
        let now = now_rfc3339();
        set_default(&mut obj, "id", || json!(uuid::Uuid::new_v4().to_string()));
        set_default(&mut obj, "created_at", || json!(now.clone()));

        match table {
            Table::Orders => {
                require(&obj, table, &["branch_id", "table_number"])?;
                let next = self.next_order_number + 1;
                set_default(&mut obj, "order_number", || json!(next.to_string()));
                if obj.get("order_number") == Some(&json!(next.to_string())) {
                    self.next_order_number = next;
                }
                set_default(&mut obj, "status", || json!("New"));
                set_default(&mut obj, "total_amount", || json!(0.0));
                set_default(&mut obj, "updated_at", || json!(now.clone()));
                for col in ["notes", "created_by", "ready_at"] {
                    set_default(&mut obj, col, || Value::Null);
                }
            }
            Table::OrderItems => {
                require(&obj, table, &["order_id", "menu_item_id", "quantity", "unit_price"])?;
                let quantity = obj.get("quantity").and_then(Value::as_i64).unwrap_or(0);
                if quantity <= 0 {
                    return Err(ClientError::ConstraintViolation(format!(
                        "order_items.quantity must be positive, got {quantity}"
                    )));
                }
                let quantity = i32::try_from(quantity).map_err(|_| {
                    ClientError::ConstraintViolation(format!(
                        "order_items.quantity {quantity} is out of range"
                    ))
                })?;
                let order_id = obj.get("order_id").cloned().unwrap_or(Value::Null);
                let parent_exists = self
                    .tables
                    .get(&Table::Orders)
                    .is_some_and(|rows| rows.iter().any(|r| r.get("id") == Some(&order_id)));
                if !parent_exists {
                    return Err(ClientError::ConstraintViolation(format!(
                        "order_items.order_id {order_id} references a missing order"
                    )));
                }
                let unit_price = obj.get("unit_price").and_then(Value::as_f64).unwrap_or(0.0);
                set_default(&mut obj, "total_price", || {
                    json!(money::to_f64(money::line_total(quantity, unit_price)))
                });
                set_default(&mut obj, "special_instructions", || Value::Null);
            }
            Table::Notifications => {
                require(&obj, table, &["branch_id", "title", "message"])?;
                set_default(&mut obj, "type", || json!("order"));
                set_default(&mut obj, "is_read", || json!(false));
                for col in ["order_id", "expires_at", "device_id"] {
                    set_default(&mut obj, col, || Value::Null);
                }
            }
            Table::Branches | Table::BranchUsers | Table::MenuCategories | Table::MenuItems => {
                set_default(&mut obj, "updated_at", || json!(now.clone()));
            }
            Table::MenuWithCategories => {
                return Err(ClientError::ConstraintViolation(
                    "menu_with_categories is a read-only view".into(),
                ));
            }
        }
        Ok(Value::Object(obj))
    }

    /// `menu_with_categories`: available items joined with their category
    fn menu_view(&self) -> Vec<Value> {
        let categories = self.tables.get(&Table::MenuCategories).cloned().unwrap_or_default();
        let items = self.tables.get(&Table::MenuItems).cloned().unwrap_or_default();
        items
            .into_iter()
            .filter_map(|mut item| {
                let category = categories
                    .iter()
                    .find(|c| c.get("id").is_some() && c.get("id") == item.get("category_id"))?;
                let obj = item.as_object_mut()?;
                obj.insert("category_name".into(), category.get("name").cloned().unwrap_or(Value::Null));
                obj.insert(
                    "category_order".into(),
                    category.get("display_order").cloned().unwrap_or(json!(0)),
                );
                Some(item)
            })
            .collect()
    }
}

fn set_default(obj: &mut Map<String, Value>, key: &str, value: impl FnOnce() -> Value) {
    if obj.get(key).is_none_or(Value::is_null) {
        obj.insert(key.to_string(), value());
    }
}

fn require(obj: &Map<String, Value>, table: Table, columns: &[&str]) -> ClientResult<()> {
    for col in columns {
        if obj.get(*col).is_none_or(Value::is_null) {
            return Err(ClientError::ConstraintViolation(format!(
                "null value in column \"{col}\" of relation \"{table}\""
            )));
        }
    }
    Ok(())
}

fn injected(op: &str, table: Table) -> ClientError {
    ClientError::Api {
        status: 503,
        code: Some("injected".into()),
        message: format!("injected {op} failure on {table}"),
    }
}

/// 内存后端 - tests and offline demo
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<ChangeEvent>,
    auth: broadcast::Sender<AuthEvent>,
    subscriptions: Arc<DashMap<Table, usize>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let (auth, _) = broadcast::channel(AUTH_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
            auth,
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    /// Register a password user; returns its identity
    pub fn add_user(&self, email: &str, password: &str, user_id: &str) -> AuthUser {
        let user = AuthUser {
            id: user_id.to_string(),
            email: Some(email.to_string()),
        };
        self.state.lock().users.insert(
            email.to_lowercase(),
            MemoryUser {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    /// Insert rows without publishing change events
    pub fn seed(&self, table: Table, rows: Vec<Value>) -> ClientResult<Vec<Value>> {
        let mut state = self.state.lock();
        let prepared = rows
            .into_iter()
            .map(|row| state.prepare_row(table, row))
            .collect::<ClientResult<Vec<_>>>()?;
        state.tables.entry(table).or_default().extend(prepared.iter().cloned());
        Ok(prepared)
    }

    /// Snapshot of a table
    pub fn rows(&self, table: Table) -> Vec<Value> {
        let state = self.state.lock();
        match table {
            Table::MenuWithCategories => state.menu_view(),
            _ => state.tables.get(&table).cloned().unwrap_or_default(),
        }
    }

    /// Publish a change event as if another client wrote the row
    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    /// Make the next insert into `table` fail
    pub fn fail_next_insert(&self, table: Table) {
        *self.state.lock().failures.insert.entry(table).or_default() += 1;
    }

    /// Make the next delete on `table` fail
    pub fn fail_next_delete(&self, table: Table) {
        *self.state.lock().failures.delete.entry(table).or_default() += 1;
    }

    /// Make the next `times` selects on `table` fail
    pub fn fail_selects(&self, table: Table, times: u32) {
        *self.state.lock().failures.select.entry(table).or_default() += times;
    }

    /// Make the next remote sign-out fail (local session is still dropped)
    pub fn fail_next_sign_out(&self) {
        self.state.lock().failures.sign_out = true;
    }

    /// Live change-feed subscriptions for a table
    pub fn active_subscriptions(&self, table: Table) -> usize {
        self.subscriptions.get(&table).map(|n| *n).unwrap_or(0)
    }

    fn publish(&self, kind: ChangeKind, table: Table, new: Option<Value>, old: Option<Value>) {
        // No subscribers is fine
        let _ = self.changes.send(ChangeEvent::new(kind, table, new, old));
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> ClientResult<AuthSession> {
        let session = {
            let mut state = self.state.lock();
            let user = match state.users.get(&email.to_lowercase()) {
                Some(u) if u.password == password => u.user.clone(),
                _ => return Err(ClientError::InvalidCredentials),
            };
            let session = state.issue_session(user);
            state.session = Some(session.clone());
            session
        };
        let _ = self.auth.send(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> ClientResult<()> {
        let failed = {
            let mut state = self.state.lock();
            state.session = None;
            std::mem::take(&mut state.failures.sign_out)
        };
        let _ = self.auth.send(AuthEvent::SignedOut);
        if failed {
            return Err(injected("sign-out", Table::BranchUsers));
        }
        Ok(())
    }

    async fn current_session(&self) -> Option<AuthSession> {
        self.state.lock().session.clone()
    }

    async fn refresh_session(&self) -> ClientResult<AuthSession> {
        let session = {
            let mut state = self.state.lock();
            let user = state
                .session
                .as_ref()
                .map(|s| s.user.clone())
                .ok_or(ClientError::NotAuthenticated)?;
            let session = state.issue_session(user);
            state.session = Some(session.clone());
            session
        };
        let _ = self.auth.send(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth.subscribe()
    }

    async fn select(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>> {
        let mut state = self.state.lock();
        if Failures::take(&mut state.failures.select, table) {
            return Err(injected("select", table));
        }
        let rows = match table {
            Table::MenuWithCategories => state.menu_view(),
            _ => state.tables.get(&table).cloned().unwrap_or_default(),
        };
        Ok(query.apply(&rows))
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> ClientResult<Vec<Value>> {
        let inserted = {
            let mut state = self.state.lock();
            if Failures::take(&mut state.failures.insert, table) {
                return Err(injected("insert", table));
            }
            // Single statement: validate every row before storing any
            let prepared = rows
                .into_iter()
                .map(|row| state.prepare_row(table, row))
                .collect::<ClientResult<Vec<_>>>()?;
            state.tables.entry(table).or_default().extend(prepared.iter().cloned());
            prepared
        };
        for row in &inserted {
            self.publish(ChangeKind::Insert, table, Some(row.clone()), None);
        }
        Ok(inserted)
    }

    async fn update(&self, table: Table, patch: Value, query: &Query) -> ClientResult<Vec<Value>> {
        let Value::Object(patch) = patch else {
            return Err(ClientError::Validation(
                ErrorCode::InvalidRequest,
                format!("update of {table} expects an object"),
            ));
        };
        let changed = {
            let mut state = self.state.lock();
            let now = now_rfc3339();
            let mut changed = Vec::new();
            for row in state.tables.entry(table).or_default().iter_mut() {
                if !query.matches(row) {
                    continue;
                }
                let old = row.clone();
                if let Value::Object(obj) = row {
                    for (k, v) in &patch {
                        obj.insert(k.clone(), v.clone());
                    }
                    if table == Table::Orders && !patch.contains_key("updated_at") {
                        obj.insert("updated_at".into(), json!(now.clone()));
                    }
                }
                changed.push((old, row.clone()));
            }
            changed
        };
        for (old, new) in &changed {
            self.publish(ChangeKind::Update, table, Some(new.clone()), Some(old.clone()));
        }
        Ok(changed.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>> {
        let removed = {
            let mut state = self.state.lock();
            if Failures::take(&mut state.failures.delete, table) {
                return Err(injected("delete", table));
            }
            let rows = state.tables.entry(table).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                std::mem::take(rows).into_iter().partition(|r| query.matches(r));
            *rows = kept;
            removed
        };
        for row in &removed {
            self.publish(ChangeKind::Delete, table, None, Some(row.clone()));
        }
        Ok(removed)
    }

    async fn subscribe(&self, table: Table, filter: Option<ChangeFilter>) -> ClientResult<ChangeStream> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(CHANGE_STREAM_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let subscriptions = self.subscriptions.clone();
        *subscriptions.entry(table).or_default() += 1;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = feed.recv() => match result {
                        Ok(event) => {
                            if event.table != table {
                                continue;
                            }
                            if filter.as_ref().is_some_and(|f| !f.matches(&event)) {
                                continue;
                            }
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(table = %table, skipped = n, "Memory change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            if let Some(mut n) = subscriptions.get_mut(&table) {
                *n = n.saturating_sub(1);
            }
            tracing::debug!(table = %table, "Memory subscription closed");
        });

        Ok(ChangeStream::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn order_row(branch: &str, table: &str) -> Value {
        json!({"branch_id": branch, "table_number": table, "status": "New", "total_amount": 10.0})
    }

    #[tokio::test]
    async fn test_sign_in_and_events() {
        let backend = MemoryBackend::new();
        backend.add_user("chef@saffron.test", "pw", "u1");
        let mut events = backend.auth_events();

        assert!(matches!(
            backend.sign_in_with_password("chef@saffron.test", "wrong").await,
            Err(ClientError::InvalidCredentials)
        ));

        let session = backend.sign_in_with_password("Chef@Saffron.test", "pw").await.unwrap();
        assert_eq!(session.user.id, "u1");
        assert!(matches!(events.recv().await.unwrap(), AuthEvent::SignedIn(_)));

        let refreshed = backend.refresh_session().await.unwrap();
        assert_ne!(refreshed.access_token, session.access_token);
        assert!(matches!(events.recv().await.unwrap(), AuthEvent::TokenRefreshed(_)));

        backend.fail_next_sign_out();
        assert!(backend.sign_out().await.is_err());
        assert!(backend.current_session().await.is_none());
        assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedOut);
    }

    #[tokio::test]
    async fn test_insert_defaults_and_sequence() {
        let backend = MemoryBackend::new();
        let rows = backend
            .insert(Table::Orders, vec![order_row("b1", "1"), order_row("b1", "2")])
            .await
            .unwrap();
        assert_eq!(rows[0]["order_number"], "1");
        assert_eq!(rows[1]["order_number"], "2");
        assert!(rows[0]["id"].as_str().is_some());
        assert!(rows[0]["ready_at"].is_null());
    }

    #[tokio::test]
    async fn test_constraints() {
        let backend = MemoryBackend::new();
        let err = backend
            .insert(Table::Orders, vec![json!({"branch_id": "b1"})])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConstraintViolation(_)));

        let err = backend
            .insert(
                Table::OrderItems,
                vec![json!({"order_id": "missing", "menu_item_id": "m", "quantity": 1, "unit_price": 1.0})],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConstraintViolation(_)));
        assert!(backend.rows(Table::OrderItems).is_empty());

        let err = backend
            .insert(
                Table::OrderItems,
                vec![json!({"order_id": "o1", "menu_item_id": "m", "quantity": 3_000_000_000i64, "unit_price": 1.0})],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConstraintViolation(ref msg) if msg.contains("out of range")));
        assert!(backend.rows(Table::OrderItems).is_empty());

        let err = backend.insert(Table::Orders, vec![json!("not a row")]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_failure_injection_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next_insert(Table::Notifications);
        let row = json!({"branch_id": "b1", "title": "t", "message": "m"});
        assert!(backend.insert(Table::Notifications, vec![row.clone()]).await.is_err());
        assert!(backend.insert(Table::Notifications, vec![row]).await.is_ok());

        backend.fail_selects(Table::BranchUsers, 2);
        let q = Query::new();
        assert!(backend.select(Table::BranchUsers, &q).await.is_err());
        assert!(backend.select(Table::BranchUsers, &q).await.is_err());
        assert!(backend.select(Table::BranchUsers, &q).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_scoped_and_zero_rows() {
        let backend = MemoryBackend::new();
        let rows = backend.insert(Table::Orders, vec![order_row("b1", "4")]).await.unwrap();
        let id = rows[0]["id"].clone();

        let miss = backend
            .update(Table::Orders, json!({"status": "Ready"}), &Query::new().eq("id", id.clone()).eq("branch_id", "b2"))
            .await
            .unwrap();
        assert!(miss.is_empty());

        let hit = backend
            .update(Table::Orders, json!({"status": "Ready"}), &Query::new().eq("id", id).eq("branch_id", "b1"))
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0]["status"], "Ready");
    }

    #[tokio::test]
    async fn test_subscription_filters_and_closes() {
        let backend = MemoryBackend::new();
        let mut stream = backend
            .subscribe(Table::Orders, Some(ChangeFilter::eq("branch_id", "b1")))
            .await
            .unwrap();
        assert_eq!(backend.active_subscriptions(Table::Orders), 1);

        backend.insert(Table::Orders, vec![order_row("b2", "1")]).await.unwrap();
        backend
            .insert(Table::Notifications, vec![json!({"branch_id": "b1", "title": "t", "message": "m"})])
            .await
            .unwrap();
        backend.insert(Table::Orders, vec![order_row("b1", "9")]).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table, Table::Orders);
        assert_eq!(event.new.as_ref().unwrap()["table_number"], "9");

        drop(stream);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.active_subscriptions(Table::Orders), 0);
    }

    #[tokio::test]
    async fn test_menu_view_joins_categories() {
        let backend = MemoryBackend::new();
        backend
            .seed(Table::MenuCategories, vec![json!({"id": "c1", "name": "Curries", "display_order": 2, "is_active": true})])
            .unwrap();
        backend
            .seed(
                Table::MenuItems,
                vec![
                    json!({"id": "m1", "name": "Korma", "price": 9.5, "category_id": "c1", "is_available": true}),
                    json!({"id": "m2", "name": "Orphan", "price": 1.0, "category_id": "zz", "is_available": true}),
                ],
            )
            .unwrap();
        let view = backend.select(Table::MenuWithCategories, &Query::new()).await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0]["category_name"], "Curries");
        assert_eq!(view[0]["category_order"], 2);
    }
}

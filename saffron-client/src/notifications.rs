//! Branch notifications: unread list, read flags, and order event rows

use crate::backend::{Backend, Query, decode_first, decode_rows};
use crate::cache::{Invalidation, QueryCache, QueryKey};
use crate::error::{BestEffort, ClientError, ClientResult};
use crate::session::SessionStore;
use serde_json::json;
use shared::message::Table;
use shared::models::{NOTIFICATION_TYPE_ORDER, NewNotification, Notification, Order};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NotificationService {
    backend: Arc<dyn Backend>,
    session: Arc<SessionStore>,
    cache: Arc<QueryCache>,
    device_id: String,
}

impl NotificationService {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: Arc<SessionStore>,
        cache: Arc<QueryCache>,
        device_id: String,
    ) -> Self {
        Self {
            backend,
            session,
            cache,
            device_id,
        }
    }

    /// Device id stamped on rows this client publishes
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Unread notifications for the active branch, newest first
    ///
    /// Never served from cache; polling and realtime keep it current.
    pub async fn list_unread(&self) -> ClientResult<Vec<Notification>> {
        let branch_id = self.session.require_branch_id()?;
        let backend = self.backend.clone();
        let key = QueryKey::notifications(&branch_id);
        self.cache
            .fetch(key, Duration::ZERO, || async move {
                let query = Query::new()
                    .eq("branch_id", branch_id.as_str())
                    .eq("is_read", false)
                    .order("created_at", false);
                let rows = backend.select(Table::Notifications, &query).await?;
                let notifications: Vec<Notification> = decode_rows(rows)?;
                tracing::debug!(
                    branch_id = %branch_id,
                    count = notifications.len(),
                    "Fetched unread notifications"
                );
                Ok(notifications)
            })
            .await
    }

    /// Badge count
    pub async fn unread_count(&self) -> ClientResult<usize> {
        Ok(self.list_unread().await?.len())
    }

    /// Mark one notification read; an id outside the branch changes nothing
    pub async fn mark_read(&self, notification_id: &str) -> ClientResult<()> {
        let branch_id = self.session.require_branch_id()?;
        let query = Query::new()
            .eq("id", notification_id)
            .eq("branch_id", branch_id.as_str());
        let rows = self
            .backend
            .update(Table::Notifications, json!({ "is_read": true }), &query)
            .await?;
        if rows.is_empty() {
            tracing::debug!(notification_id = %notification_id, "mark_read matched no rows");
        }
        self.cache.invalidate(&Invalidation::NotificationLists { branch_id });
        Ok(())
    }

    /// Mark every unread notification of the branch read; returns how many changed
    pub async fn mark_all_read(&self) -> ClientResult<usize> {
        let branch_id = self.session.require_branch_id()?;
        let query = Query::new()
            .eq("branch_id", branch_id.as_str())
            .eq("is_read", false);
        let rows = self
            .backend
            .update(Table::Notifications, json!({ "is_read": true }), &query)
            .await?;
        tracing::info!(branch_id = %branch_id, count = rows.len(), "Marked all notifications read");
        self.cache.invalidate(&Invalidation::NotificationLists { branch_id });
        Ok(rows.len())
    }

    /// Insert a notification row; failure is logged, never propagated
    pub async fn publish(&self, notification: NewNotification) -> BestEffort<Notification> {
        let result: ClientResult<Notification> = async {
            let row = serde_json::to_value(&notification)?;
            let rows = self.backend.insert(Table::Notifications, vec![row]).await?;
            decode_first::<Notification>(rows)?
                .ok_or_else(|| ClientError::Internal("notification insert returned no row".into()))
        }
        .await;
        if let Ok(n) = &result {
            tracing::debug!(notification_id = %n.id, title = %n.title, "Notification published");
        }
        BestEffort::new(result).log_failure("publish notification")
    }

    /// Publish an order lifecycle notification from this device
    pub async fn publish_for_order(&self, order: &Order, title: &str, message: String) -> BestEffort<Notification> {
        self.publish(NewNotification {
            branch_id: order.branch_id.clone(),
            title: title.to_string(),
            message,
            kind: NOTIFICATION_TYPE_ORDER.to_string(),
            order_id: Some(order.id.clone()),
            is_read: false,
            device_id: self.device_id.clone(),
        })
        .await
    }
}

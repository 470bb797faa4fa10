//! Change feed to cache bridge
//!
//! For the active branch, follows the `orders` and `notifications` change
//! feeds and turns each event into [`Invalidation`] messages on the cache
//! queue. New notifications are also offered to the [`NotificationGate`]
//! for a local push, and new rows of either table trigger a warning haptic.

use crate::backend::{Backend, ChangeStream};
use crate::cache::{Invalidation, Invalidator};
use crate::device::{Haptic, HapticFeedback};
use crate::error::{BestEffort, ClientError, ClientResult};
use crate::gate::NotificationGate;
use shared::message::{ChangeEvent, ChangeFilter, ChangeKind, Table};
use shared::models::Notification;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Invalidations for one `orders` event
pub fn order_invalidations(branch_id: &str, event: &ChangeEvent) -> Vec<Invalidation> {
    let mut out = vec![
        Invalidation::OrderLists {
            branch_id: branch_id.to_string(),
        },
        Invalidation::OrderStats {
            branch_id: branch_id.to_string(),
        },
    ];
    if matches!(event.kind, ChangeKind::Update | ChangeKind::Delete)
        && let Some(order_id) = event.record_id()
    {
        out.push(Invalidation::OrderDetail {
            branch_id: branch_id.to_string(),
            order_id: order_id.to_string(),
        });
    }
    out
}

/// Invalidations for one `notifications` event
pub fn notification_invalidations(branch_id: &str, _event: &ChangeEvent) -> Vec<Invalidation> {
    vec![Invalidation::NotificationLists {
        branch_id: branch_id.to_string(),
    }]
}

/// Running subscriptions for one branch
#[derive(Debug)]
pub struct BridgeHandle {
    branch_id: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    /// Cancel both subscriptions and wait for them to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(branch_id = %self.branch_id, "Realtime task ended abnormally: {e}");
            }
        }
        tracing::info!(branch_id = %self.branch_id, "Realtime bridge stopped");
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeBridge {
    backend: Arc<dyn Backend>,
    invalidator: Invalidator,
    gate: Arc<NotificationGate>,
    haptics: Arc<dyn HapticFeedback>,
}

impl RealtimeBridge {
    pub fn new(
        backend: Arc<dyn Backend>,
        invalidator: Invalidator,
        gate: Arc<NotificationGate>,
        haptics: Arc<dyn HapticFeedback>,
    ) -> Self {
        Self {
            backend,
            invalidator,
            gate,
            haptics,
        }
    }

    /// Subscribe to both tables for `branch_id`
    ///
    /// Tasks end when `cancel` fires or the returned handle is stopped.
    pub async fn start(&self, branch_id: &str, cancel: CancellationToken) -> ClientResult<BridgeHandle> {
        let filter = ChangeFilter::eq("branch_id", branch_id);
        let orders = self.backend.subscribe(Table::Orders, Some(filter.clone())).await?;
        let notifications = self.backend.subscribe(Table::Notifications, Some(filter)).await?;

        let cancel = cancel.child_token();
        let tasks = vec![
            self.spawn_consumer(branch_id.to_string(), orders, cancel.clone()),
            self.spawn_consumer(branch_id.to_string(), notifications, cancel.clone()),
        ];
        tracing::info!(branch_id = %branch_id, "Realtime bridge started");
        Ok(BridgeHandle {
            branch_id: branch_id.to_string(),
            cancel,
            tasks,
        })
    }

    fn spawn_consumer(&self, branch_id: String, mut stream: ChangeStream, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => bridge.handle_event(&branch_id, event).await,
                        None => {
                            tracing::warn!(branch_id = %branch_id, "Change feed closed");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Apply one change event
    pub async fn handle_event(&self, branch_id: &str, event: ChangeEvent) {
        tracing::debug!(
            branch_id = %branch_id,
            table = %event.table,
            kind = ?event.kind,
            record_id = ?event.record_id(),
            "Change received"
        );
        let invalidations = match event.table {
            Table::Orders => order_invalidations(branch_id, &event),
            Table::Notifications => notification_invalidations(branch_id, &event),
            other => {
                tracing::debug!(table = %other, "Ignoring change for unbridged table");
                return;
            }
        };
        for invalidation in invalidations {
            if !self.invalidator.send(invalidation) {
                tracing::debug!("Invalidation queue closed");
                break;
            }
        }

        if event.kind != ChangeKind::Insert {
            return;
        }
        self.haptics.trigger(Haptic::Warning);
        if event.table == Table::Notifications {
            // Failure already logged
            let _ = self.present(&event).await;
        }
    }

    async fn present(&self, event: &ChangeEvent) -> BestEffort<()> {
        let result = match event.decode_new::<Notification>() {
            Some(Ok(notification)) => self.gate.present(&notification).await.map(|decision| {
                tracing::debug!(notification_id = %notification.id, decision = ?decision, "Notification handled");
            }),
            Some(Err(e)) => Err(ClientError::from(e)),
            None => Err(ClientError::Realtime("notification insert without row".into())),
        };
        BestEffort::new(result).log_failure("present notification")
    }
}

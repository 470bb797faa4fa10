//! Fixed-interval refetch for branch-scoped lists
//!
//! Realtime delivery is not guaranteed while offline, so order lists,
//! notifications and stats are also invalidated on a timer.

use super::{Invalidation, Invalidator};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Floor for both intervals; `interval` panics on zero
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Poller {
    invalidator: Invalidator,
    order_interval: Duration,
    stats_interval: Duration,
}

impl Poller {
    pub fn new(invalidator: Invalidator, order_interval: Duration, stats_interval: Duration) -> Self {
        Self {
            invalidator,
            order_interval: order_interval.max(MIN_POLL_INTERVAL),
            stats_interval: stats_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Poll one branch until `cancel` fires
    pub fn spawn(&self, branch_id: String, cancel: CancellationToken) -> JoinHandle<()> {
        let invalidator = self.invalidator.clone();
        let mut orders = tokio::time::interval(self.order_interval);
        let mut stats = tokio::time::interval(self.stats_interval);
        orders.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // skip immediate ticks
            orders.tick().await;
            stats.tick().await;
            tracing::debug!(branch_id = %branch_id, "Polling started");

            loop {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = orders.tick() => {
                        invalidator.send(Invalidation::OrderLists { branch_id: branch_id.clone() })
                            && invalidator.send(Invalidation::NotificationLists { branch_id: branch_id.clone() })
                    }
                    _ = stats.tick() => {
                        invalidator.send(Invalidation::OrderStats { branch_id: branch_id.clone() })
                    }
                };
                if !sent {
                    tracing::debug!(branch_id = %branch_id, "Invalidation queue closed");
                    break;
                }
            }
            tracing::debug!(branch_id = %branch_id, "Polling stopped");
        })
    }
}

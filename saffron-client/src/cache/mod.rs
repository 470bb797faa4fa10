//! Keyed stale-while-revalidate query cache
//!
//! Entries are keyed by resource + filters + branch id. Writers never patch
//! cached data; they send an [`Invalidation`] and readers refetch. Stale
//! entries stay readable through [`QueryCache::peek`] until replaced.

mod poller;

pub use poller::Poller;

use crate::error::ClientResult;
use dashmap::DashMap;
use shared::models::OrderStatus;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Invalidated-key broadcast capacity
const INVALIDATED_CAPACITY: usize = 256;

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Orders {
        branch_id: String,
        status: Option<OrderStatus>,
    },
    Order {
        branch_id: String,
        order_id: String,
    },
    OrderStats {
        branch_id: String,
    },
    Notifications {
        branch_id: String,
    },
    MenuCategories,
    MenuItems,
    MenuItemsByCategory {
        category_id: String,
    },
    MenuSearch {
        query: String,
    },
    VegetarianItems,
}

impl QueryKey {
    pub fn orders(branch_id: &str, status: Option<OrderStatus>) -> Self {
        QueryKey::Orders {
            branch_id: branch_id.to_string(),
            status,
        }
    }

    pub fn order(branch_id: &str, order_id: &str) -> Self {
        QueryKey::Order {
            branch_id: branch_id.to_string(),
            order_id: order_id.to_string(),
        }
    }

    pub fn order_stats(branch_id: &str) -> Self {
        QueryKey::OrderStats {
            branch_id: branch_id.to_string(),
        }
    }

    pub fn notifications(branch_id: &str) -> Self {
        QueryKey::Notifications {
            branch_id: branch_id.to_string(),
        }
    }

    /// Branch the key is scoped to; menu keys are global
    pub fn branch_id(&self) -> Option<&str> {
        match self {
            QueryKey::Orders { branch_id, .. }
            | QueryKey::Order { branch_id, .. }
            | QueryKey::OrderStats { branch_id }
            | QueryKey::Notifications { branch_id } => Some(branch_id),
            _ => None,
        }
    }
}

/// Invalidation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every order list for the branch, whatever the status filter
    OrderLists { branch_id: String },
    OrderDetail { branch_id: String, order_id: String },
    OrderStats { branch_id: String },
    NotificationLists { branch_id: String },
    Key(QueryKey),
    All,
}

impl Invalidation {
    pub fn matches(&self, key: &QueryKey) -> bool {
        match (self, key) {
            (Invalidation::All, _) => true,
            (Invalidation::Key(k), key) => k == key,
            (Invalidation::OrderLists { branch_id }, QueryKey::Orders { branch_id: b, .. }) => {
                branch_id == b
            }
            (
                Invalidation::OrderDetail { branch_id, order_id },
                QueryKey::Order {
                    branch_id: b,
                    order_id: o,
                },
            ) => branch_id == b && order_id == o,
            (Invalidation::OrderStats { branch_id }, QueryKey::OrderStats { branch_id: b }) => {
                branch_id == b
            }
            (
                Invalidation::NotificationLists { branch_id },
                QueryKey::Notifications { branch_id: b },
            ) => branch_id == b,
            _ => false,
        }
    }
}

/// Sending half of the invalidation queue
#[derive(Debug, Clone)]
pub struct Invalidator {
    tx: mpsc::UnboundedSender<Invalidation>,
}

impl Invalidator {
    /// Enqueue; `false` once the worker is gone
    pub fn send(&self, invalidation: Invalidation) -> bool {
        self.tx.send(invalidation).is_ok()
    }
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    fetched_at: Instant,
    stale: bool,
}

impl Entry {
    fn is_fresh(&self, stale_time: Duration) -> bool {
        !self.stale && self.fetched_at.elapsed() < stale_time
    }
}

pub struct QueryCache {
    entries: DashMap<QueryKey, Entry>,
    /// Bumped on every applied invalidation
    epoch: AtomicU64,
    invalidated: broadcast::Sender<QueryKey>,
    tx: mpsc::UnboundedSender<Invalidation>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Invalidation>>>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (invalidated, _) = broadcast::channel(INVALIDATED_CAPACITY);
        Self {
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
            invalidated,
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    pub fn invalidator(&self) -> Invalidator {
        Invalidator {
            tx: self.tx.clone(),
        }
    }

    /// Keys invalidated from now on, for views that refetch
    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidated.subscribe()
    }

    /// Cached value while fresh, otherwise run `fetcher` and store its result
    ///
    /// Errors are returned as-is and leave the entry untouched.
    pub async fn fetch<T, F, Fut>(&self, key: QueryKey, stale_time: Duration, fetcher: F) -> ClientResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        if let Some(entry) = self.entries.get(&key)
            && entry.is_fresh(stale_time)
            && let Some(value) = entry.value.downcast_ref::<T>()
        {
            tracing::trace!(key = ?key, "Cache hit");
            return Ok(value.clone());
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let value = fetcher().await?;
        // An invalidation landed while fetching: keep the data but refetch next time
        let stale = self.epoch.load(Ordering::Acquire) != epoch;
        self.entries.insert(
            key,
            Entry {
                value: Arc::new(value.clone()),
                fetched_at: Instant::now(),
                stale,
            },
        );
        Ok(value)
    }

    /// Cached value, fresh or stale
    pub fn peek<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.entries
            .get(key)
            .and_then(|entry| entry.value.downcast_ref::<T>().cloned())
    }

    pub fn is_fresh(&self, key: &QueryKey, stale_time: Duration) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_fresh(stale_time))
    }

    /// Mark matching entries stale and announce them; returns how many matched
    pub fn invalidate(&self, invalidation: &Invalidation) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut keys = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if invalidation.matches(entry.key()) {
                entry.stale = true;
                keys.push(entry.key().clone());
            }
        }
        tracing::debug!(invalidation = ?invalidation, matched = keys.len(), "Cache invalidated");
        let matched = keys.len();
        for key in keys {
            // No listeners is fine
            let _ = self.invalidated.send(key);
        }
        matched
    }

    /// Drop everything (sign-out)
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
        tracing::debug!("Cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply queued invalidations until cancelled
    ///
    /// The queue has a single consumer; a second call returns `None`.
    pub fn spawn_worker(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            tracing::debug!("Cache invalidation worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(invalidation) => {
                            cache.invalidate(&invalidation);
                        }
                        None => break,
                    }
                }
            }
            tracing::debug!("Cache invalidation worker stopped");
        }))
    }
}

//! Composition root
//!
//! [`AppState`] owns every store and service and the background tasks that
//! tie them together:
//!
//! - cache invalidation worker
//! - auth event listener
//! - branch watcher: follows the session and (re)starts the per-branch
//!   realtime bridge and poller, tearing down the previous branch first
//!
//! Nothing here is a global; the presentation layer holds an `Arc<AppState>`.

use crate::backend::Backend;
use crate::cache::{Poller, QueryCache};
use crate::config::ClientConfig;
use crate::device::Platform;
use crate::error::{BestEffort, ClientResult};
use crate::gate::NotificationGate;
use crate::menu::MenuService;
use crate::notifications::NotificationService;
use crate::orders::OrderService;
use crate::realtime::{BridgeHandle, RealtimeBridge};
use crate::retry::RetryPolicy;
use crate::session::{Profile, SessionStore};
use shared::models::BranchName;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Realtime and polling for the active branch
#[derive(Debug)]
struct BranchScope {
    branch_id: String,
    cancel: CancellationToken,
    bridge: BridgeHandle,
    poller: JoinHandle<()>,
}

impl BranchScope {
    async fn stop(self) {
        self.cancel.cancel();
        self.bridge.stop().await;
        if let Err(e) = self.poller.await {
            tracing::warn!(branch_id = %self.branch_id, "Poller ended abnormally: {e}");
        }
    }
}

#[derive(Debug)]
pub struct AppState {
    config: ClientConfig,
    platform: Platform,
    session: Arc<SessionStore>,
    cache: Arc<QueryCache>,
    gate: Arc<NotificationGate>,
    orders: OrderService,
    menu: MenuService,
    notifications: NotificationService,
    bridge: RealtimeBridge,
    poller: Poller,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    scope: tokio::sync::Mutex<Option<BranchScope>>,
}

impl AppState {
    pub fn new(config: ClientConfig, backend: Arc<dyn Backend>, platform: Platform) -> Self {
        let cache = Arc::new(QueryCache::new());
        let session = Arc::new(SessionStore::new(
            backend.clone(),
            RetryPolicy::from_config(&config).with_jitter(),
            platform.haptics.clone(),
        ));

        let gate = Arc::new(NotificationGate::new(
            config.notification_dedup_ttl,
            platform.notifier.clone(),
        ));
        let device_id = gate.register_device(&platform.device).to_string();

        let notifications =
            NotificationService::new(backend.clone(), session.clone(), cache.clone(), device_id);
        let orders = OrderService::new(
            backend.clone(),
            session.clone(),
            cache.clone(),
            notifications.clone(),
            platform.haptics.clone(),
        );
        let menu = MenuService::new(backend.clone(), cache.clone(), config.menu_stale_time);
        let bridge = RealtimeBridge::new(
            backend,
            cache.invalidator(),
            gate.clone(),
            platform.haptics.clone(),
        );
        let poller = Poller::new(
            cache.invalidator(),
            config.order_poll_interval,
            config.stats_poll_interval,
        );

        Self {
            config,
            platform,
            session,
            cache,
            gate,
            orders,
            menu,
            notifications,
            bridge,
            poller,
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            scope: tokio::sync::Mutex::new(None),
        }
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn gate(&self) -> &Arc<NotificationGate> {
        &self.gate
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn menu(&self) -> &MenuService {
        &self.menu
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    // ========== Lifecycle ==========

    /// Spawn background tasks and restore any existing session
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        {
            let mut tasks = self.tasks.lock();
            if let Some(worker) = self.cache.spawn_worker(self.shutdown.child_token()) {
                tasks.push(worker);
            }
            tasks.push(self.session.spawn_listener(self.shutdown.child_token()));
            tasks.push(self.spawn_branch_watcher());
        }
        tracing::info!(device_id = ?self.gate.device_id(), "App state started");

        match self.session.restore().await {
            Ok(Some(profile)) => self.activate_branch(&profile.branch.id).await?,
            Ok(None) => {}
            // Session kept; profile state records the failure
            Err(e) => tracing::warn!("Session restored without a branch profile: {e}"),
        }
        Ok(())
    }

    /// Sign in to `branch` and start its realtime feed
    pub async fn sign_in(&self, email: &str, password: &str, branch: BranchName) -> ClientResult<Profile> {
        let profile = self.session.sign_in(email, password, branch).await?;
        self.activate_branch(&profile.branch.id).await?;
        Ok(profile)
    }

    /// Sign out, then tear down the branch scope and drop cached data
    pub async fn sign_out(&self) -> BestEffort<()> {
        let outcome = self.session.sign_out().await;
        self.deactivate_branch().await;
        self.cache.clear();
        outcome
    }

    /// Start realtime and polling for `branch_id`
    ///
    /// No-op if it is already active or the session no longer resolves to
    /// `branch_id`; a different branch is torn down first.
    pub async fn activate_branch(&self, branch_id: &str) -> ClientResult<()> {
        let mut scope = self.scope.lock().await;
        if scope.as_ref().is_some_and(|s| s.branch_id == branch_id) {
            return Ok(());
        }
        if self.session.snapshot().branch_id() != Some(branch_id) {
            tracing::debug!(branch_id = %branch_id, "Session no longer on this branch, not activating");
            return Ok(());
        }
        if let Some(previous) = scope.take() {
            tracing::info!(from = %previous.branch_id, to = %branch_id, "Switching branch");
            previous.stop().await;
        }

        let cancel = self.shutdown.child_token();
        let bridge = self.bridge.start(branch_id, cancel.clone()).await?;
        let poller = self.poller.spawn(branch_id.to_string(), cancel.clone());
        *scope = Some(BranchScope {
            branch_id: branch_id.to_string(),
            cancel,
            bridge,
            poller,
        });
        tracing::info!(branch_id = %branch_id, "Branch activated");
        Ok(())
    }

    pub async fn deactivate_branch(&self) {
        if let Some(scope) = self.scope.lock().await.take() {
            let branch_id = scope.branch_id.clone();
            scope.stop().await;
            tracing::info!(branch_id = %branch_id, "Branch deactivated");
        }
    }

    /// Branch with live realtime subscriptions
    pub async fn active_branch(&self) -> Option<String> {
        self.scope.lock().await.as_ref().map(|s| s.branch_id.clone())
    }

    /// Follow session changes made outside `sign_in` / `sign_out`
    fn spawn_branch_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let app = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        let mut rx = self.session.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let (branch_id, signed_in) = {
                            let snapshot = rx.borrow_and_update();
                            (snapshot.branch_id().map(str::to_string), snapshot.is_signed_in())
                        };
                        match branch_id {
                            Some(branch_id) => {
                                if let Err(e) = app.activate_branch(&branch_id).await {
                                    tracing::error!(branch_id = %branch_id, "Failed to activate branch: {e}");
                                }
                            }
                            None if !signed_in => {
                                app.deactivate_branch().await;
                                app.cache.clear();
                            }
                            // Profile still resolving or failed; keep what is running
                            None => {}
                        }
                    }
                }
            }
            tracing::debug!("Branch watcher stopped");
        })
    }

    /// Cancel every task and wait for them
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down app state");
        self.shutdown.cancel();
        self.deactivate_branch().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {e}");
            }
        }
    }
}

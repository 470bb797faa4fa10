//! Session and branch profile store
//!
//! Holds `{session, user, profile, loading}` behind a `watch` channel.
//! Sign-in only succeeds once the signed-in identity resolves to an active
//! branch user of the requested branch; anything else signs back out so no
//! partial session is left behind.
//!
//! Profile resolution after auth events retries transient failures and
//! never clears the session on failure: the snapshot moves to
//! [`ProfileState::Failed`] and the session stays.

use crate::backend::{AuthEvent, AuthSession, AuthUser, Backend, Query, decode_first};
use crate::device::{Haptic, HapticFeedback};
use crate::error::{BestEffort, ClientError, ClientResult};
use crate::retry::RetryPolicy;
use shared::message::Table;
use shared::models::{Branch, BranchName, BranchUser};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Branch user with its branch
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub branch_user: BranchUser,
    pub branch: Branch,
}

/// Branch profile resolution state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ProfileState {
    /// No identity to resolve
    #[default]
    Unresolved,
    /// Fetch in flight (including backoff)
    Pending,
    Resolved(Profile),
    /// Retries exhausted or no active branch user
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub session: Option<AuthSession>,
    pub user: Option<AuthUser>,
    pub profile: ProfileState,
    pub loading: bool,
}

impl SessionSnapshot {
    pub fn is_signed_in(&self) -> bool {
        self.session.is_some()
    }

    pub fn profile(&self) -> Option<&Profile> {
        match &self.profile {
            ProfileState::Resolved(profile) => Some(profile),
            _ => None,
        }
    }

    pub fn branch_user(&self) -> Option<&BranchUser> {
        self.profile().map(|p| &p.branch_user)
    }

    pub fn branch(&self) -> Option<&Branch> {
        self.profile().map(|p| &p.branch)
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch().map(|b| b.id.as_str())
    }

    /// Navigation shows the loading screen, not the login screen
    pub fn is_resolving(&self) -> bool {
        self.loading
            || (self.session.is_some()
                && matches!(self.profile, ProfileState::Unresolved | ProfileState::Pending))
    }
}

/// Clears the sign-in flag on every exit path
struct SigningIn<'a>(&'a AtomicBool);

impl<'a> SigningIn<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SigningIn<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SessionStore {
    backend: Arc<dyn Backend>,
    state: watch::Sender<SessionSnapshot>,
    retry: RetryPolicy,
    haptics: Arc<dyn HapticFeedback>,
    signing_in: AtomicBool,
    /// Profile refreshes run one at a time
    refreshing: tokio::sync::Mutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy, haptics: Arc<dyn HapticFeedback>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            backend,
            state,
            retry,
            haptics,
            signing_in: AtomicBool::new(false),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Active branch id; required by every branch-scoped operation
    pub fn require_branch_id(&self) -> ClientResult<String> {
        let snapshot = self.state.borrow();
        match snapshot.branch_id() {
            Some(id) => Ok(id.to_string()),
            None if snapshot.session.is_none() => Err(ClientError::NotAuthenticated),
            None => Err(ClientError::NoActiveBranch),
        }
    }

    /// Signed-in auth user id
    pub fn user_id(&self) -> Option<String> {
        self.state.borrow().user.as_ref().map(|u| u.id.clone())
    }

    /// Sign in and require the identity to belong to `branch`
    pub async fn sign_in(&self, email: &str, password: &str, branch: BranchName) -> ClientResult<Profile> {
        let _guard = SigningIn::enter(&self.signing_in);
        self.state.send_modify(|s| s.loading = true);
        tracing::info!(email = %email, branch = %branch, "Signing in");

        let result = self.sign_in_inner(email, password, branch).await;
        match &result {
            Ok(profile) => {
                tracing::info!(
                    user_id = %profile.branch_user.id,
                    branch_id = %profile.branch.id,
                    "Signed in"
                );
                self.haptics.trigger(Haptic::Success);
            }
            Err(e) => {
                tracing::warn!(email = %email, branch = %branch, "Sign-in failed: {e}");
                self.state.send_modify(|s| s.loading = false);
                self.haptics.trigger(Haptic::Error);
            }
        }
        result
    }

    async fn sign_in_inner(&self, email: &str, password: &str, branch: BranchName) -> ClientResult<Profile> {
        let session = self.backend.sign_in_with_password(email, password).await?;
        let user_id = session.user.id.clone();

        let profile = match self.retry.run("branch user", || self.fetch_profile(&user_id)).await {
            Ok(profile) => profile,
            Err(e) => {
                self.abandon_session().await;
                return Err(match e {
                    ClientError::ProfileUnavailable(_) => e,
                    other => ClientError::ProfileUnavailable(other.to_string()),
                });
            }
        };

        if profile.branch.name != branch {
            tracing::warn!(
                user_id = %user_id,
                requested = %branch,
                actual = %profile.branch.name,
                "User is not authorized for requested branch"
            );
            self.abandon_session().await;
            return Err(ClientError::BranchNotAuthorized {
                requested: branch.to_string(),
            });
        }

        self.state.send_replace(SessionSnapshot {
            user: Some(session.user.clone()),
            session: Some(session),
            profile: ProfileState::Resolved(profile.clone()),
            loading: false,
        });
        Ok(profile)
    }

    /// Sign out remotely and reset local state
    async fn abandon_session(&self) {
        if let Err(e) = self.backend.sign_out().await {
            tracing::warn!("Sign-out after rejected sign-in failed: {e}");
        }
        self.state.send_replace(SessionSnapshot::default());
    }

    /// Local state is always cleared; the remote revoke is best effort
    pub async fn sign_out(&self) -> BestEffort<()> {
        tracing::info!("Signing out");
        let remote = self.backend.sign_out().await;
        self.state.send_replace(SessionSnapshot::default());
        self.haptics.trigger(Haptic::Success);
        BestEffort::new(remote).log_failure("remote sign-out")
    }

    /// Adopt a session the backend already holds
    pub async fn restore(&self) -> ClientResult<Option<Profile>> {
        self.state.send_modify(|s| s.loading = true);
        let Some(session) = self.backend.current_session().await else {
            self.state.send_modify(|s| s.loading = false);
            tracing::debug!("No session to restore");
            return Ok(None);
        };
        tracing::info!(user_id = %session.user.id, "Restoring session");
        self.adopt_session(session);
        self.refresh_branch_user().await.map(Some)
    }

    /// Re-resolve the branch profile for the current session
    ///
    /// Failure leaves the session in place with `ProfileState::Failed`.
    pub async fn refresh_branch_user(&self) -> ClientResult<Profile> {
        let user_id = self.user_id().ok_or(ClientError::NotAuthenticated)?;
        let _refreshing = self.refreshing.lock().await;
        self.state.send_modify(|s| {
            s.profile = ProfileState::Pending;
            s.loading = false;
        });

        let result = self.retry.run("branch user", || self.fetch_profile(&user_id)).await;
        let applied = self.state.send_if_modified(|s| {
            if s.user.as_ref().map(|u| u.id.as_str()) != Some(user_id.as_str()) {
                // Signed out or switched user while fetching
                return false;
            }
            s.profile = match &result {
                Ok(profile) => ProfileState::Resolved(profile.clone()),
                Err(e) => ProfileState::Failed(e.to_string()),
            };
            true
        });
        if !applied {
            tracing::debug!(user_id = %user_id, "Discarding profile for stale session");
        }
        match &result {
            Ok(profile) => tracing::info!(
                user_id = %user_id,
                branch_id = %profile.branch.id,
                "Branch profile resolved"
            ),
            Err(e) => tracing::error!(user_id = %user_id, "Branch profile unavailable: {e}"),
        }
        result
    }

    fn adopt_session(&self, session: AuthSession) {
        self.state.send_modify(|s| {
            s.user = Some(session.user.clone());
            s.session = Some(session);
        });
    }

    /// Active branch user for `user_id` plus its branch
    async fn fetch_profile(&self, user_id: &str) -> ClientResult<Profile> {
        let rows = self
            .backend
            .select(
                Table::BranchUsers,
                &Query::new().eq("id", user_id).eq("is_active", true).limit(1),
            )
            .await?;
        let branch_user: BranchUser = decode_first(rows)?.ok_or_else(|| {
            ClientError::ProfileUnavailable(format!("no active branch user for {user_id}"))
        })?;

        let rows = self
            .backend
            .select(Table::Branches, &Query::new().eq("id", branch_user.branch_id.as_str()).limit(1))
            .await?;
        let branch: Branch = decode_first(rows)?.ok_or_else(|| {
            ClientError::ProfileUnavailable(format!("branch {} not found", branch_user.branch_id))
        })?;

        Ok(Profile { branch_user, branch })
    }

    async fn handle_auth_event(&self, event: AuthEvent) {
        tracing::debug!(event = event.name(), "Auth state changed");
        match event {
            AuthEvent::SignedIn(session) => {
                if self.signing_in.load(Ordering::SeqCst) {
                    // sign_in records its own outcome
                    return;
                }
                let current = self.backend.current_session().await;
                if current.as_ref().map(|s| &s.user.id) != Some(&session.user.id) {
                    tracing::debug!(user_id = %session.user.id, "Ignoring sign-in for a session already gone");
                    return;
                }
                // Resolved or already being resolved for this user
                let already = {
                    let snapshot = self.state.borrow();
                    let same_user = snapshot.user.as_ref().is_some_and(|u| u.id == session.user.id);
                    match &snapshot.profile {
                        ProfileState::Resolved(p) => p.branch_user.id == session.user.id,
                        ProfileState::Pending => same_user,
                        _ => false,
                    }
                };
                self.adopt_session(session);
                if !already {
                    // Errors are logged and recorded in the snapshot
                    let _ = self.refresh_branch_user().await;
                }
            }
            AuthEvent::SignedOut => {
                if self.backend.current_session().await.is_some() {
                    tracing::debug!("Ignoring stale sign-out, a newer session exists");
                    return;
                }
                self.state.send_if_modified(|s| {
                    let changed = *s != SessionSnapshot::default();
                    *s = SessionSnapshot::default();
                    changed
                });
            }
            AuthEvent::TokenRefreshed(session) => {
                // Profile stays as is
                self.adopt_session(session);
            }
            AuthEvent::UserUpdated(user) => {
                self.state.send_modify(|s| s.user = Some(user));
            }
        }
    }

    /// Follow backend auth events until cancelled
    pub fn spawn_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = self.backend.auth_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => store.handle_auth_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Auth event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("Auth listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::device::TracingHaptics;
    use serde_json::json;
    use std::time::Duration;

    fn seeded() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .seed(
                Table::Branches,
                vec![
                    json!({"id": "b-cardiff", "name": "Cardiff"}),
                    json!({"id": "b-wembley", "name": "Wembley"}),
                ],
            )
            .unwrap();
        backend.add_user("chef@saffron.test", "pw", "u1");
        backend
            .seed(
                Table::BranchUsers,
                vec![json!({"id": "u1", "branch_id": "b-cardiff", "role": "staff", "is_active": true})],
            )
            .unwrap();
        backend
    }

    fn store(backend: &Arc<MemoryBackend>) -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            backend.clone(),
            RetryPolicy::new(3, Duration::from_secs(1)),
            Arc::new(TracingHaptics),
        ))
    }

    #[tokio::test]
    async fn test_sign_in_resolves_profile() {
        let backend = seeded();
        let store = store(&backend);
        let profile = store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();
        assert_eq!(profile.branch.id, "b-cardiff");

        let snap = store.snapshot();
        assert!(snap.is_signed_in());
        assert!(!snap.is_resolving());
        assert_eq!(snap.branch_id(), Some("b-cardiff"));
        assert_eq!(store.require_branch_id().unwrap(), "b-cardiff");
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let backend = seeded();
        let store = store(&backend);
        let err = store.sign_in("chef@saffron.test", "nope", BranchName::Cardiff).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidCredentials));
        assert_eq!(store.snapshot(), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn test_inactive_user_rejected() {
        let backend = seeded();
        backend.add_user("old@saffron.test", "pw", "u2");
        backend
            .seed(
                Table::BranchUsers,
                vec![json!({"id": "u2", "branch_id": "b-cardiff", "role": "staff", "is_active": false})],
            )
            .unwrap();
        let store = store(&backend);
        let err = store.sign_in("old@saffron.test", "pw", BranchName::Cardiff).await.unwrap_err();
        assert!(matches!(err, ClientError::ProfileUnavailable(_)));
        assert!(!store.snapshot().is_signed_in());
        assert!(backend.current_session().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_session() {
        let backend = seeded();
        let store = store(&backend);
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();

        backend.fail_selects(Table::BranchUsers, 4);
        let err = store.refresh_branch_user().await.unwrap_err();
        assert!(err.is_transient());

        let snap = store.snapshot();
        assert!(snap.is_signed_in());
        assert!(matches!(snap.profile, ProfileState::Failed(_)));
        assert!(!snap.is_resolving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_recovers_after_transient_failures() {
        let backend = seeded();
        let store = store(&backend);
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();

        backend.fail_selects(Table::BranchUsers, 3);
        let profile = store.refresh_branch_user().await.unwrap();
        assert_eq!(profile.branch_user.id, "u1");
        assert_eq!(store.snapshot().branch_id(), Some("b-cardiff"));
    }

    #[tokio::test]
    async fn test_sign_out_clears_even_when_remote_fails() {
        let backend = seeded();
        let store = store(&backend);
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();

        backend.fail_next_sign_out();
        let outcome = store.sign_out().await;
        assert!(!outcome.is_ok());
        assert_eq!(store.snapshot(), SessionSnapshot::default());
        assert!(matches!(store.require_branch_id(), Err(ClientError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn test_token_refresh_keeps_profile() {
        let backend = seeded();
        let store = store(&backend);
        let cancel = CancellationToken::new();
        store.spawn_listener(cancel.clone());
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();
        let mut rx = store.subscribe();

        let refreshed = backend.refresh_session().await.unwrap();
        let snap = rx
            .wait_for(|s| s.session.as_ref() == Some(&refreshed))
            .await
            .unwrap()
            .clone();
        assert_eq!(snap.branch_id(), Some("b-cardiff"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_restore_adopts_existing_session() {
        let backend = seeded();
        backend.sign_in_with_password("chef@saffron.test", "pw").await.unwrap();

        let store = store(&backend);
        let profile = store.restore().await.unwrap().unwrap();
        assert_eq!(profile.branch.name, BranchName::Cardiff);
        assert!(!store.snapshot().loading);
    }

    #[tokio::test]
    async fn test_restore_without_session() {
        let backend = seeded();
        let store = store(&backend);
        assert!(store.restore().await.unwrap().is_none());
        assert!(!store.snapshot().is_resolving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_event_during_refresh_does_not_refetch() {
        let backend = seeded();
        let store = store(&backend);
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();
        let session = backend.current_session().await.unwrap();

        // 1 attempt + 3 retries, all for the in-flight refresh
        backend.fail_selects(Table::BranchUsers, 4);
        let refresh = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_branch_user().await })
        };
        store
            .subscribe()
            .wait_for(|s| s.profile == ProfileState::Pending)
            .await
            .unwrap();

        store.handle_auth_event(AuthEvent::SignedIn(session)).await;
        assert_eq!(store.snapshot().profile, ProfileState::Pending);

        assert!(refresh.await.unwrap().is_err());
        let snap = store.snapshot();
        assert!(snap.is_signed_in());
        assert!(matches!(snap.profile, ProfileState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_run_one_at_a_time() {
        let backend = seeded();
        let store = store(&backend);
        store.sign_in("chef@saffron.test", "pw", BranchName::Cardiff).await.unwrap();

        backend.fail_selects(Table::BranchUsers, 4);
        let (first, second) = tokio::join!(store.refresh_branch_user(), store.refresh_branch_user());
        // The second starts only after the first used up every failure
        assert!(first.is_err());
        assert_eq!(second.unwrap().branch.id, "b-cardiff");
        assert!(store.snapshot().profile().is_some());
    }
}

//! Backend abstraction
//!
//! Everything the app-state layer needs from the hosted backend: password
//! auth with an auth-event stream, filtered table reads and writes, and a
//! per-table change feed. [`SupabaseBackend`] talks to the real service,
//! [`MemoryBackend`] keeps rows in process for tests and offline demos.

mod memory;
mod query;
mod realtime;
mod supabase;

pub use memory::MemoryBackend;
pub use query::{Filter, Order, Query};
pub use supabase::SupabaseBackend;

use crate::error::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::message::{ChangeEvent, ChangeFilter, Table};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Session issued by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl AuthSession {
    /// Seconds until expiry at `now` (unix seconds), `None` if unknown
    pub fn expires_in(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| at - now)
    }
}

/// Auth state change
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    SignedOut,
    TokenRefreshed(AuthSession),
    UserUpdated(AuthUser),
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::SignedIn(_) => "SIGNED_IN",
            AuthEvent::SignedOut => "SIGNED_OUT",
            AuthEvent::TokenRefreshed(_) => "TOKEN_REFRESHED",
            AuthEvent::UserUpdated(_) => "USER_UPDATED",
        }
    }
}

/// Live subscription to one table's change feed
///
/// Dropping the stream ends the subscription.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl ChangeStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next event; `None` once the feed is closed
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Token that ends the producer side
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Channel capacity for a single subscription
pub(crate) const CHANGE_STREAM_CAPACITY: usize = 256;

/// Hosted backend capabilities
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Password sign-in; fails with `InvalidCredentials`
    async fn sign_in_with_password(&self, email: &str, password: &str) -> ClientResult<AuthSession>;

    /// Revoke remotely (best effort) and always drop the local session
    async fn sign_out(&self) -> ClientResult<()>;

    /// Session currently held, if any
    async fn current_session(&self) -> Option<AuthSession>;

    /// Exchange the refresh token for a new session
    async fn refresh_session(&self) -> ClientResult<AuthSession>;

    /// Subscribe to auth state changes
    fn auth_events(&self) -> broadcast::Receiver<AuthEvent>;

    /// Filtered read; zero matches is an empty list, not an error
    async fn select(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>>;

    /// Insert rows, returning them with server-generated columns
    async fn insert(&self, table: Table, rows: Vec<Value>) -> ClientResult<Vec<Value>>;

    /// Patch rows matching the query; zero affected rows is not an error
    async fn update(&self, table: Table, patch: Value, query: &Query) -> ClientResult<Vec<Value>>;

    /// Delete rows matching the query
    async fn delete(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>>;

    /// Open a change feed for a table, optionally filtered server-side
    async fn subscribe(&self, table: Table, filter: Option<ChangeFilter>) -> ClientResult<ChangeStream>;
}

/// Decode rows into a typed model
pub fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> ClientResult<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

/// Decode the first row, if any
pub fn decode_first<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> ClientResult<Option<T>> {
    rows.into_iter()
        .next()
        .map(serde_json::from_value)
        .transpose()
        .map_err(Into::into)
}

//! Hosted backend over HTTP
//!
//! - `/auth/v1` password and refresh-token grants, logout
//! - `/rest/v1/{table}` reads and writes with `Prefer: return=representation`
//! - `/realtime/v1/websocket` change feed (see [`super::realtime`])
//!
//! The access token is refreshed in the background shortly before it
//! expires; a 401 on a table call also triggers one refresh and retry.

use super::realtime::{self, ChannelConfig};
use super::{AuthEvent, AuthSession, AuthUser, Backend, ChangeStream, Query};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use shared::message::{ChangeFilter, Table};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Refresh this long before the token expires
const REFRESH_MARGIN_SECS: i64 = 60;
/// Floor for the refresh timer
const MIN_REFRESH_DELAY_SECS: i64 = 5;
/// Delay between failed background refreshes
const REFRESH_RETRY_SECS: u64 = 10;
const AUTH_CHANNEL_CAPACITY: usize = 64;

/// GoTrue token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs)
        });
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

struct Inner {
    http: Client,
    base_url: String,
    anon_key: String,
    heartbeat: Duration,
    session: RwLock<Option<AuthSession>>,
    auth_tx: broadcast::Sender<AuthEvent>,
    refresh_task: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseBackend")
            .field("base_url", &self.base_url)
            .field("signed_in", &self.session.read().is_some())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn bearer(&self) -> String {
        let token = self
            .session
            .read()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone());
        format!("Bearer {token}")
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("apikey", &self.anon_key)
            .header(reqwest::header::AUTHORIZATION, self.bearer())
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> ClientResult<AuthSession> {
        let response = self
            .http
            .post(self.url("auth/v1/token"))
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            if grant_type == "password"
                && (status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED)
            {
                return Err(ClientError::InvalidCredentials);
            }
            return Err(ClientError::from_response(status.as_u16(), &text));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session())
    }

    /// Store a fresh session, announce it, and reschedule the refresh timer
    fn adopt_session(self: &Arc<Self>, session: AuthSession, event: AuthEvent) {
        *self.session.write() = Some(session.clone());
        let _ = self.auth_tx.send(event);
        self.schedule_refresh(&session);
    }

    fn cancel_refresh(&self) {
        if let Some(token) = self.refresh_task.lock().take() {
            token.cancel();
        }
    }

    fn schedule_refresh(self: &Arc<Self>, session: &AuthSession) {
        self.cancel_refresh();
        let Some(expires_in) = session.expires_in(chrono::Utc::now().timestamp()) else {
            return;
        };
        let delay = (expires_in - REFRESH_MARGIN_SECS).max(MIN_REFRESH_DELAY_SECS) as u64;
        let token = CancellationToken::new();
        *self.refresh_task.lock() = Some(token.clone());

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut wait = Duration::from_secs(delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                match inner.refresh().await {
                    // refresh() scheduled the next timer
                    Ok(_) => return,
                    Err(ClientError::NotAuthenticated) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "Background token refresh failed, retrying");
                        wait = Duration::from_secs(REFRESH_RETRY_SECS);
                    }
                }
            }
        });
    }

    async fn refresh(self: &Arc<Self>) -> ClientResult<AuthSession> {
        let refresh_token = self
            .session
            .read()
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(ClientError::NotAuthenticated)?;
        let session = self
            .token_grant("refresh_token", json!({"refresh_token": refresh_token}))
            .await?;
        tracing::debug!(user_id = %session.user.id, "Access token refreshed");
        self.adopt_session(session.clone(), AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn send_rest(
        &self,
        method: Method,
        table: Table,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> ClientResult<reqwest::Response> {
        let mut request = self
            .request(method, &format!("rest/v1/{table}"))
            .query(params)
            .header("Prefer", "return=representation");
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn rest(
        self: &Arc<Self>,
        method: Method,
        table: Table,
        params: Vec<(String, String)>,
        body: Option<Value>,
    ) -> ClientResult<Vec<Value>> {
        let mut response = self
            .send_rest(method.clone(), table, &params, body.as_ref())
            .await?;

        let has_session = self.session.read().is_some();
        if response.status() == StatusCode::UNAUTHORIZED && has_session {
            tracing::debug!(table = %table, "401 from table call, refreshing token");
            self.refresh().await?;
            response = self.send_rest(method, table, &params, body.as_ref()).await?;
        }

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::from_response(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row => Ok(vec![row]),
        }
    }
}

/// Backend client for a hosted Supabase project
#[derive(Debug, Clone)]
pub struct SupabaseBackend {
    inner: Arc<Inner>,
}

impl SupabaseBackend {
    /// Create a client; fails when URL or key are missing
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let (base_url, anon_key) = match (&config.supabase_url, &config.supabase_anon_key) {
            (Some(url), Some(key)) => (url.clone(), key.clone()),
            _ => return Err(ClientError::Config("backend URL and key are required".into())),
        };
        let http = Client::builder().timeout(config.request_timeout()).build()?;
        let (auth_tx, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url,
                anon_key,
                heartbeat: config.realtime_heartbeat,
                session: RwLock::new(None),
                auth_tx,
                refresh_task: Mutex::new(None),
            }),
        })
    }

    /// Adopt a session persisted by the host app
    pub fn set_session(&self, session: AuthSession) {
        self.inner
            .adopt_session(session.clone(), AuthEvent::SignedIn(session));
    }
}

#[async_trait]
impl Backend for SupabaseBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> ClientResult<AuthSession> {
        let session = self
            .inner
            .token_grant("password", json!({"email": email, "password": password}))
            .await?;
        tracing::info!(user_id = %session.user.id, "Signed in");
        self.inner
            .adopt_session(session.clone(), AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> ClientResult<()> {
        let had_session = self.inner.session.read().is_some();
        let remote = if had_session {
            match self.inner.request(Method::POST, "auth/v1/logout").send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    Err(ClientError::from_response(status, &text))
                }
                Err(e) => Err(e.into()),
            }
        } else {
            Ok(())
        };

        // Local state is always dropped
        self.inner.cancel_refresh();
        *self.inner.session.write() = None;
        let _ = self.inner.auth_tx.send(AuthEvent::SignedOut);
        remote
    }

    async fn current_session(&self) -> Option<AuthSession> {
        self.inner.session.read().clone()
    }

    async fn refresh_session(&self) -> ClientResult<AuthSession> {
        self.inner.refresh().await
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_tx.subscribe()
    }

    async fn select(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>> {
        self.inner
            .rest(Method::GET, table, query.to_select_params(), None)
            .await
    }

    async fn insert(&self, table: Table, rows: Vec<Value>) -> ClientResult<Vec<Value>> {
        self.inner
            .rest(Method::POST, table, Vec::new(), Some(Value::Array(rows)))
            .await
    }

    async fn update(&self, table: Table, patch: Value, query: &Query) -> ClientResult<Vec<Value>> {
        self.inner
            .rest(Method::PATCH, table, query.to_filter_params(), Some(patch))
            .await
    }

    async fn delete(&self, table: Table, query: &Query) -> ClientResult<Vec<Value>> {
        self.inner
            .rest(Method::DELETE, table, query.to_filter_params(), None)
            .await
    }

    async fn subscribe(&self, table: Table, filter: Option<ChangeFilter>) -> ClientResult<ChangeStream> {
        let inner = Arc::clone(&self.inner);
        let channel = ChannelConfig {
            url: realtime::socket_url(&self.inner.base_url, &self.inner.anon_key),
            table,
            filter,
            heartbeat: self.inner.heartbeat,
            token: Arc::new(move || {
                inner
                    .session
                    .read()
                    .as_ref()
                    .map(|s| s.access_token.clone())
                    .unwrap_or_else(|| inner.anon_key.clone())
            }),
        };
        let cancel = CancellationToken::new();
        let rx = realtime::spawn_channel(channel, cancel.clone());
        Ok(ChangeStream::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_config() {
        let err = SupabaseBackend::new(&ClientConfig::default()).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_token_response_expiry() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "r",
            "user": {"id": "u1", "email": "chef@saffron.test", "role": "authenticated"}
        }))
        .unwrap();
        let now = chrono::Utc::now().timestamp();
        let session = token.into_session();
        assert_eq!(session.user.id, "u1");
        let left = session.expires_in(now).unwrap();
        assert!((3590..=3610).contains(&left));
    }

    #[tokio::test]
    async fn test_bearer_falls_back_to_anon_key() {
        let config = ClientConfig::default().with_supabase("https://demo.supabase.co", "anon-key");
        let backend = SupabaseBackend::new(&config).unwrap();
        assert_eq!(backend.inner.bearer(), "Bearer anon-key");
        assert_eq!(
            backend.inner.url("/rest/v1/orders"),
            "https://demo.supabase.co/rest/v1/orders"
        );

        backend.set_session(AuthSession {
            access_token: "user-token".into(),
            refresh_token: "r".into(),
            expires_at: None,
            user: AuthUser {
                id: "u1".into(),
                email: None,
            },
        });
        assert_eq!(backend.inner.bearer(), "Bearer user-token");
        assert!(backend.current_session().await.is_some());
    }
}

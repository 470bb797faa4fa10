//! Client error types

use serde_json::Value;
use shared::error::{AppError, ErrorCode};
use shared::models::OrderStatus;
use thiserror::Error;

/// PostgREST code for an expired access token
const JWT_EXPIRED: &str = "PGRST301";

/// Client error type
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Email/password rejected by the identity provider
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// Authentication required
    #[error("Authentication required")]
    NotAuthenticated,

    /// Access token rejected as expired
    #[error("Session expired")]
    SessionExpired,

    /// Operation needs a resolved branch profile
    #[error("No active branch")]
    NoActiveBranch,

    /// Signed-in user belongs to a different branch
    #[error("User not authorized for branch {requested}")]
    BranchNotAuthorized { requested: String },

    /// Branch user could not be resolved for the signed-in identity
    #[error("Branch profile unavailable: {0}")]
    ProfileUnavailable(String),

    /// Resource not found, with the specific code
    #[error("Not found: {1}")]
    NotFound(ErrorCode, String),

    /// Input rejected before reaching the backend, with the specific code
    #[error("Validation error: {1}")]
    Validation(ErrorCode, String),

    /// Status change that does not move forward
    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// Row changed between read and write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend rejected the row (check / foreign key / not null)
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Any other backend error response
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Order row exists without its items and cleanup failed
    #[error("Order {order_id} was created but its items were not saved")]
    PartialWrite { order_id: String },

    /// Realtime channel failure
    #[error("Realtime error: {0}")]
    Realtime(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Unified error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Http(e) if e.is_timeout() => ErrorCode::TimeoutError,
            ClientError::Http(_) => ErrorCode::NetworkError,
            ClientError::Serialization(_) => ErrorCode::InvalidRequest,
            ClientError::InvalidCredentials => ErrorCode::InvalidCredentials,
            ClientError::NotAuthenticated => ErrorCode::NotAuthenticated,
            ClientError::NoActiveBranch => ErrorCode::BranchNotSelected,
            ClientError::BranchNotAuthorized { .. } => ErrorCode::BranchNotAuthorized,
            ClientError::ProfileUnavailable(_) => ErrorCode::ProfileUnavailable,
            ClientError::SessionExpired => ErrorCode::SessionExpired,
            ClientError::NotFound(code, _) | ClientError::Validation(code, _) => *code,
            ClientError::InvalidTransition { .. } => ErrorCode::InvalidStatusTransition,
            ClientError::Conflict(_) => ErrorCode::Conflict,
            ClientError::ConstraintViolation(_) => ErrorCode::ConstraintViolation,
            ClientError::Api { status: 401, .. } => ErrorCode::NotAuthenticated,
            ClientError::Api { status: 403, .. } => ErrorCode::PermissionDenied,
            ClientError::Api { status: 404, .. } => ErrorCode::NotFound,
            ClientError::Api { .. } => ErrorCode::BackendError,
            ClientError::PartialWrite { .. } => ErrorCode::OrderPartiallyCreated,
            ClientError::Realtime(_) => ErrorCode::RealtimeError,
            ClientError::Config(_) => ErrorCode::ConfigError,
            ClientError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Text for the blocking alert shown when a primary operation fails
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Api { message, .. } if !message.is_empty() => message.clone(),
            ClientError::BranchNotAuthorized { .. } => {
                "User not authorized for this branch".to_string()
            }
            ClientError::Validation(_, msg)
            | ClientError::NotFound(_, msg)
            | ClientError::ConstraintViolation(msg) => msg.clone(),
            ClientError::InvalidTransition { .. } | ClientError::PartialWrite { .. } => {
                self.to_string()
            }
            _ => self.code().message().to_string(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClientError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            ClientError::Realtime(_) => true,
            _ => false,
        }
    }

    /// Build an error from a backend error body (`{code, message, details, hint}`)
    ///
    /// Postgres class 23 codes (integrity violations) become
    /// [`ClientError::ConstraintViolation`].
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let field = |name: &str| {
            parsed
                .as_ref()
                .and_then(|v| v.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let code = field("code").or_else(|| field("error"));
        let message = field("message")
            .or_else(|| field("msg"))
            .or_else(|| field("error_description"))
            .unwrap_or_else(|| body.trim().to_string());

        if code.as_deref().is_some_and(|c| c.starts_with("23")) {
            return ClientError::ConstraintViolation(message);
        }
        if status == 401 {
            return match code.as_deref() {
                Some(JWT_EXPIRED) => ClientError::SessionExpired,
                _ => ClientError::NotAuthenticated,
            };
        }
        ClientError::Api {
            status,
            code,
            message,
        }
    }

    /// Convert to the alert value handed to the presentation layer
    pub fn to_app_error(&self) -> AppError {
        let err = AppError::with_message(self.code(), self.user_message());
        match self {
            ClientError::PartialWrite { order_id } => err.with_detail("order_id", order_id.as_str()),
            ClientError::InvalidTransition { from, to } => err
                .with_detail("from", from.as_str())
                .with_detail("to", to.as_str()),
            ClientError::Api { status, .. } => err.with_detail("status", *status),
            _ => err,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Outcome of a side effect whose failure must not fail the caller
///
/// Failures are logged when [`BestEffort::log_failure`] runs; after that
/// the value can be dropped.
#[derive(Debug)]
pub struct BestEffort<T>(ClientResult<T>);

impl<T> BestEffort<T> {
    pub fn new(result: ClientResult<T>) -> Self {
        Self(result)
    }

    /// Log a failure at warn level and keep the outcome
    pub fn log_failure(self, context: &str) -> Self {
        if let Err(e) = &self.0 {
            tracing::warn!(context = context, code = %e.code(), error = %e, "Best-effort side effect failed");
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_ok()
    }

    pub fn ok(self) -> Option<T> {
        self.0.ok()
    }

    pub fn into_result(self) -> ClientResult<T> {
        self.0
    }
}

impl<T> From<ClientResult<T>> for BestEffort<T> {
    fn from(result: ClientResult<T>) -> Self {
        Self::new(result)
    }
}

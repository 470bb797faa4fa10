//! Unified error codes for the Saffron client
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Authentication errors
//! - 2xxx: Permission errors
//! - 3xxx: Branch errors
//! - 4xxx: Order errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values so they can be shown to
/// staff and attached to logs without depending on the Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Invalid request
    InvalidRequest = 5,
    /// Required field missing
    RequiredField = 7,
    /// Row violates a backend constraint
    ConstraintViolation = 9,
    /// Concurrent modification detected
    Conflict = 10,

    // ==================== 1xxx: Auth ====================
    /// User is not authenticated
    NotAuthenticated = 1001,
    /// Invalid credentials (email/password)
    InvalidCredentials = 1002,
    /// Session has expired
    SessionExpired = 1005,

    // ==================== 2xxx: Permission ====================
    /// Permission denied
    PermissionDenied = 2001,

    // ==================== 3xxx: Branch ====================
    /// No branch is active for this session
    BranchNotSelected = 3001,
    /// User is not authorized for the requested branch
    BranchNotAuthorized = 3003,
    /// Branch profile could not be resolved
    ProfileUnavailable = 3004,

    // ==================== 4xxx: Order ====================
    /// Order not found
    OrderNotFound = 4001,
    /// Status change is not a forward transition
    InvalidStatusTransition = 4002,
    /// Order has no items
    OrderEmpty = 4003,
    /// Table number missing
    TableNumberRequired = 4004,
    /// Order row written but its items were not
    OrderPartiallyCreated = 4005,
    /// Invalid quantity or price on an order line
    InvalidOrderLine = 4006,

    // ==================== 9xxx: System ====================
    /// Internal error
    InternalError = 9001,
    /// Backend returned an unexpected error
    BackendError = 9002,
    /// Network error
    NetworkError = 9003,
    /// Operation timeout
    TimeoutError = 9004,
    /// Configuration error
    ConfigError = 9005,
    /// Realtime channel failure
    RealtimeError = 9101,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Get the English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::RequiredField => "Required field is missing",
            ErrorCode::ConstraintViolation => "Data violates a backend constraint",
            ErrorCode::Conflict => "The record was changed by someone else",

            // Auth
            ErrorCode::NotAuthenticated => "User is not authenticated",
            ErrorCode::InvalidCredentials => "Invalid email or password",
            ErrorCode::SessionExpired => "Session has expired",

            // Permission
            ErrorCode::PermissionDenied => "Permission denied",

            // Branch
            ErrorCode::BranchNotSelected => "No branch is active",
            ErrorCode::BranchNotAuthorized => "User is not authorized for this branch",
            ErrorCode::ProfileUnavailable => "Branch profile is unavailable",

            // Order
            ErrorCode::OrderNotFound => "Order not found",
            ErrorCode::InvalidStatusTransition => "Order status cannot move backwards",
            ErrorCode::OrderEmpty => "Order must contain at least one item",
            ErrorCode::TableNumberRequired => "Table number is required",
            ErrorCode::OrderPartiallyCreated => "Order was created without its items",
            ErrorCode::InvalidOrderLine => "Invalid quantity or price",

            // System
            ErrorCode::InternalError => "Internal error",
            ErrorCode::BackendError => "Backend error",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::RealtimeError => "Realtime connection error",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            // General
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::Unknown),
            2 => Ok(ErrorCode::ValidationFailed),
            3 => Ok(ErrorCode::NotFound),
            5 => Ok(ErrorCode::InvalidRequest),
            7 => Ok(ErrorCode::RequiredField),
            9 => Ok(ErrorCode::ConstraintViolation),
            10 => Ok(ErrorCode::Conflict),

            // Auth
            1001 => Ok(ErrorCode::NotAuthenticated),
            1002 => Ok(ErrorCode::InvalidCredentials),
            1005 => Ok(ErrorCode::SessionExpired),

            // Permission
            2001 => Ok(ErrorCode::PermissionDenied),

            // Branch
            3001 => Ok(ErrorCode::BranchNotSelected),
            3003 => Ok(ErrorCode::BranchNotAuthorized),
            3004 => Ok(ErrorCode::ProfileUnavailable),

            // Order
            4001 => Ok(ErrorCode::OrderNotFound),
            4002 => Ok(ErrorCode::InvalidStatusTransition),
            4003 => Ok(ErrorCode::OrderEmpty),
            4004 => Ok(ErrorCode::TableNumberRequired),
            4005 => Ok(ErrorCode::OrderPartiallyCreated),
            4006 => Ok(ErrorCode::InvalidOrderLine),

            // System
            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::BackendError),
            9003 => Ok(ErrorCode::NetworkError),
            9004 => Ok(ErrorCode::TimeoutError),
            9005 => Ok(ErrorCode::ConfigError),
            9101 => Ok(ErrorCode::RealtimeError),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

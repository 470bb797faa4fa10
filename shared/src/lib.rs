//! Shared types for Saffron
//!
//! Data model, change-feed messages, error codes and money helpers used by
//! the client crate. No I/O lives here.

pub mod error;
pub mod message;
pub mod models;
pub mod money;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use error::{AppError, AppResult, ErrorCategory, ErrorCode};
pub use message::{ChangeEvent, ChangeFilter, ChangeKind, Table};

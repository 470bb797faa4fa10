//! Data models
//!
//! Row shapes of the hosted backend tables, as the client consumes them.
//! All IDs are uuid strings; timestamps are UTC.

pub mod branch;
pub mod menu;
pub mod notification;
pub mod order;

// Re-exports
pub use branch::*;
pub use menu::*;
pub use notification::*;
pub use order::*;

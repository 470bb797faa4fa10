//! Saffron Client - app-state layer for the restaurant order app
//!
//! Session, query cache, order / menu / notification operations and the
//! realtime bridge, over a hosted backend ([`SupabaseBackend`]) or an
//! in-process one ([`MemoryBackend`]). [`AppState`] wires them together.

pub mod app;
pub mod backend;
pub mod cache;
pub mod cart;
pub mod config;
pub mod device;
pub mod error;
pub mod gate;
pub mod logger;
pub mod menu;
pub mod notifications;
pub mod orders;
pub mod realtime;
pub mod retry;
pub mod session;

pub use app::AppState;
pub use backend::{AuthEvent, AuthSession, AuthUser, Backend, MemoryBackend, Query, SupabaseBackend};
pub use cache::{Invalidation, QueryCache, QueryKey};
pub use cart::{Cart, CartItem};
pub use config::ClientConfig;
pub use device::{DeviceInfo, Haptic, HapticFeedback, LocalNotification, LocalNotifier, Platform};
pub use error::{BestEffort, ClientError, ClientResult};
pub use gate::{GateDecision, NotificationGate};
pub use session::{Profile, ProfileState, SessionSnapshot, SessionStore};

// Re-export shared types for convenience
pub use shared::models::{
    BranchName, CreateOrderRequest, NewOrderItem, Notification, Order, OrderStatus, OrderSummary,
};

//! Device identity and platform effect seams
//!
//! The app-state layer never talks to the OS directly. Local notifications
//! and haptics go through [`LocalNotifier`] and [`HapticFeedback`]; the
//! defaults only log, which is what the headless monitor and tests use.

use crate::error::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Fallback when no platform identifier is available
pub const UNKNOWN_DEVICE_ID: &str = "unknown";

/// Platform identifiers available at registration time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os_internal_build_id: Option<String>,
    pub device_name: Option<String>,
}

impl DeviceInfo {
    pub fn new(os_internal_build_id: Option<String>, device_name: Option<String>) -> Self {
        Self {
            os_internal_build_id,
            device_name,
        }
    }

    /// Host-derived identity for headless runs (`HOSTNAME`, then `COMPUTERNAME`)
    pub fn from_host() -> Self {
        let device_name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok();
        Self::new(None, device_name)
    }
}

/// Build id, then device name, then `"unknown"`; blank values are skipped
pub fn resolve_device_id(info: &DeviceInfo) -> String {
    [&info.os_internal_build_id, &info.device_name]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_DEVICE_ID)
        .to_string()
}

/// Local notification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalNotification {
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Schedules a notification on this device (fire and forget)
#[async_trait]
pub trait LocalNotifier: Send + Sync + Debug {
    async fn schedule(&self, notification: LocalNotification) -> ClientResult<()>;
}

/// Haptic feedback kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Haptic {
    Success,
    Warning,
    Error,
}

pub trait HapticFeedback: Send + Sync + Debug {
    fn trigger(&self, kind: Haptic);
}

/// Logs notifications instead of showing them
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl LocalNotifier for TracingNotifier {
    async fn schedule(&self, notification: LocalNotification) -> ClientResult<()> {
        tracing::info!(
            title = %notification.title,
            data = %notification.data,
            "🔔 {}",
            notification.body
        );
        Ok(())
    }
}

/// Logs haptics at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHaptics;

impl HapticFeedback for TracingHaptics {
    fn trigger(&self, kind: Haptic) {
        tracing::debug!(kind = ?kind, "Haptic feedback");
    }
}

/// Platform bundle handed to the composition root
#[derive(Debug, Clone)]
pub struct Platform {
    pub device: DeviceInfo,
    pub notifier: Arc<dyn LocalNotifier>,
    pub haptics: Arc<dyn HapticFeedback>,
}

impl Platform {
    pub fn new(
        device: DeviceInfo,
        notifier: Arc<dyn LocalNotifier>,
        haptics: Arc<dyn HapticFeedback>,
    ) -> Self {
        Self {
            device,
            notifier,
            haptics,
        }
    }

    /// Logging-only effects
    pub fn headless(device: DeviceInfo) -> Self {
        Self::new(device, Arc::new(TracingNotifier), Arc::new(TracingHaptics))
    }
}

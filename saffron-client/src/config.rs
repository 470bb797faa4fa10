//! Client configuration

use crate::error::{ClientError, ClientResult};
use std::time::Duration;

/// 客户端配置 - 所有时间窗口和后端地址
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖（启动时先读取 `.env`）：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | SUPABASE_URL | (none) | backend base URL |
/// | SUPABASE_ANON_KEY | (none) | public API key |
/// | REQUEST_TIMEOUT_SECS | 30 | HTTP timeout |
/// | ORDER_POLL_SECS | 30 | order list / notification polling |
/// | STATS_POLL_SECS | 60 | dashboard stats polling |
/// | MENU_STALE_SECS | 1800 | menu staleness window |
/// | NOTIFICATION_DEDUP_MS | 5000 | duplicate push suppression TTL |
/// | PROFILE_RETRY_ATTEMPTS | 3 | branch user fetch retries |
/// | PROFILE_RETRY_BASE_MS | 1000 | backoff base (1s / 2s / 4s) |
/// | REALTIME_HEARTBEAT_SECS | 25 | websocket heartbeat |
/// | LOG_LEVEL | info | logger level |
/// | LOG_JSON | false | JSON log output |
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL (e.g., "https://xyz.supabase.co")
    pub supabase_url: Option<String>,
    /// Public anon key sent as `apikey`
    pub supabase_anon_key: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Order list and notification polling interval
    pub order_poll_interval: Duration,
    /// Stats polling interval
    pub stats_poll_interval: Duration,
    /// Menu queries stay fresh this long
    pub menu_stale_time: Duration,
    /// Local push de-duplication window
    pub notification_dedup_ttl: Duration,
    /// Branch user fetch retries after the first failure
    pub profile_retry_attempts: u32,
    /// First retry delay, doubled per attempt
    pub profile_retry_base: Duration,
    /// Realtime heartbeat interval
    pub realtime_heartbeat: Duration,
    pub log_level: String,
    pub log_json: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ClientConfig {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置，使用默认值
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Self {
            supabase_url: env_nonempty("SUPABASE_URL"),
            supabase_anon_key: env_nonempty("SUPABASE_ANON_KEY"),
            timeout: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(defaults.timeout),
            order_poll_interval: env_parse("ORDER_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.order_poll_interval),
            stats_poll_interval: env_parse("STATS_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stats_poll_interval),
            menu_stale_time: env_parse("MENU_STALE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.menu_stale_time),
            notification_dedup_ttl: env_parse("NOTIFICATION_DEDUP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notification_dedup_ttl),
            profile_retry_attempts: env_parse("PROFILE_RETRY_ATTEMPTS")
                .unwrap_or(defaults.profile_retry_attempts),
            profile_retry_base: env_parse("PROFILE_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.profile_retry_base),
            realtime_heartbeat: env_parse("REALTIME_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.realtime_heartbeat),
            log_level: env_nonempty("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: env_parse("LOG_JSON").unwrap_or(defaults.log_json),
        }
    }

    /// Set backend URL and key
    pub fn with_supabase(mut self, url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        self.supabase_url = Some(url.into());
        self.supabase_anon_key = Some(anon_key.into());
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Set order and stats polling intervals
    pub fn with_poll_intervals(mut self, orders: Duration, stats: Duration) -> Self {
        self.order_poll_interval = orders;
        self.stats_poll_interval = stats;
        self
    }

    pub fn with_menu_stale_time(mut self, stale: Duration) -> Self {
        self.menu_stale_time = stale;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.notification_dedup_ttl = ttl;
        self
    }

    /// Set the branch user retry policy
    pub fn with_profile_retry(mut self, attempts: u32, base: Duration) -> Self {
        self.profile_retry_attempts = attempts;
        self.profile_retry_base = base;
        self
    }

    /// Check settings needed by the hosted backend
    pub fn validate(&self) -> ClientResult<()> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| ClientError::Config("SUPABASE_URL is not set".into()))?;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ClientError::Config(format!(
                "SUPABASE_URL must be an http(s) URL, got {url}"
            )));
        }
        if self.supabase_anon_key.is_none() {
            return Err(ClientError::Config("SUPABASE_ANON_KEY is not set".into()));
        }
        if self.order_poll_interval.is_zero() || self.stats_poll_interval.is_zero() {
            return Err(ClientError::Config(
                "ORDER_POLL_SECS and STATS_POLL_SECS must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            timeout: 30,
            order_poll_interval: Duration::from_secs(30),
            stats_poll_interval: Duration::from_secs(60),
            menu_stale_time: Duration::from_secs(30 * 60),
            notification_dedup_ttl: Duration::from_millis(5000),
            profile_retry_attempts: 3,
            profile_retry_base: Duration::from_millis(1000),
            realtime_heartbeat: Duration::from_secs(25),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

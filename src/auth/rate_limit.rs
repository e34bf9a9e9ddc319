use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use chrono::{DateTime, Utc, Duration};

use crate::config::RateLimitSettings;

/// Independent attempt budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Login,
    Register,
    /// Password reset requests, reset and email verification.
    Recovery,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_size: Duration,
    pub limits: HashMap<RateLimitScope, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert(RateLimitScope::Login, 5);      // 5 attempts per window
        limits.insert(RateLimitScope::Register, 10);
        limits.insert(RateLimitScope::Recovery, 5);

        Self {
            window_size: Duration::minutes(1),
            limits,
        }
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        let mut limits = HashMap::new();
        limits.insert(RateLimitScope::Login, settings.login_attempts);
        limits.insert(RateLimitScope::Register, settings.register_attempts);
        limits.insert(RateLimitScope::Recovery, settings.recovery_attempts);

        Self {
            window_size: Duration::seconds(settings.window_seconds),
            limits,
        }
    }
}

#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    fn cleanup_old_requests(&mut self, now: DateTime<Utc>, window_size: Duration) {
        let cutoff = now - window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    fn add_request(&mut self, now: DateTime<Utc>) {
        self.timestamps.push(now);
    }

    fn request_count(&self) -> usize {
        self.timestamps.len()
    }

    fn retry_after(&self, now: DateTime<Utc>, window_size: Duration) -> u64 {
        self.timestamps
            .first()
            .map(|oldest| (*oldest + window_size - now).num_seconds().max(1) as u64)
            .unwrap_or(1)
    }
}

/// Sliding-window limiter keyed by (scope, client). Check and record happen
/// under one write lock, so concurrent attempts cannot both take the last slot.
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<(RateLimitScope, String), RequestWindow>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Records the attempt when admitted; otherwise returns the seconds until
    /// the oldest attempt leaves the window.
    pub async fn check_rate_limit(&self, scope: RateLimitScope, client: &str) -> Result<(), u64> {
        let now = Utc::now();
        let mut windows = self.windows.write().await;

        // Get or create window for this client
        let window = windows
            .entry((scope, client.to_string()))
            .or_insert_with(RequestWindow::new);

        window.cleanup_old_requests(now, self.config.window_size);

        // Scopes without a configured budget are unlimited
        let Some(limit) = self.config.limits.get(&scope) else {
            return Ok(());
        };

        if window.request_count() < *limit as usize {
            window.add_request(now);
            Ok(())
        } else {
            Err(window.retry_after(now, self.config.window_size))
        }
    }

    pub async fn cleanup(&self) {
        let now = Utc::now();
        let mut windows = self.windows.write().await;

        // Remove windows with no recent requests
        windows.retain(|_, window| {
            window.cleanup_old_requests(now, self.config.window_size);
            !window.timestamps.is_empty()
        });
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.read().await.len()
    }
}

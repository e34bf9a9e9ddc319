use async_trait::async_trait;
use tracing::{debug, info};

use crate::db::models::User;
use crate::Result;

/// Delivers one-time tokens to the account owner.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification(&self, user: &User, email: &str, token: &str) -> Result<()>;

    async fn send_password_reset(&self, user: &User, email: &str, token: &str) -> Result<()>;
}

/// Writes deliveries to the log. The token itself only appears at debug level.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_verification(&self, user: &User, email: &str, token: &str) -> Result<()> {
        info!(user_id = %user.id, email = %email, "verification email queued");
        debug!(user_id = %user.id, token = %token, "verification token");
        Ok(())
    }

    async fn send_password_reset(&self, user: &User, email: &str, token: &str) -> Result<()> {
        info!(user_id = %user.id, email = %email, "password reset email queued");
        debug!(user_id = %user.id, token = %token, "password reset token");
        Ok(())
    }
}

//! Storage seams for accounts and identity links.
//!
//! Every mutating method is one atomic transaction: the write, the
//! consistency-engine recompute and any uniqueness or recoverability check
//! commit together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{NewIdentity, NewUser, OAuthIdentity, User};
use crate::Result;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails `DuplicateUsername` on an exact, case-sensitive match. A user
    /// without a password must be created through
    /// [`IdentityLinkStore::create_user_with_identity`].
    async fn create_user(&self, new_user: NewUser) -> Result<User>;

    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// `None` clears the credential; fails `LastCredentialRemoved` when no
    /// identity would remain.
    async fn set_password_hash(&self, user_id: Uuid, password_hash: Option<String>) -> Result<User>;

    async fn record_login(&self, user_id: Uuid) -> Result<()>;

    async fn set_verification_token(&self, user_id: Uuid, token_hash: String) -> Result<()>;

    /// Marks the email verified and clears the token so it cannot be replayed.
    async fn consume_verification_token(&self, token_hash: &str) -> Result<User>;

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Clears the token, rejects it if expired, and installs the new
    /// credential in the same transaction.
    async fn consume_reset_token(&self, token_hash: &str, new_password_hash: String) -> Result<User>;

    /// Deletes the user and cascades its identities.
    async fn delete_user(&self, user_id: Uuid) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait IdentityLinkStore: Send + Sync {
    /// Upserts when the pair already belongs to `user_id`; fails
    /// `IdentityAlreadyLinked` when it belongs to anyone else.
    async fn link_identity(&self, user_id: Uuid, identity: NewIdentity) -> Result<OAuthIdentity>;

    /// Creates an OAuth-only user together with its first identity.
    async fn create_user_with_identity(
        &self,
        new_user: NewUser,
        identity: NewIdentity,
    ) -> Result<(User, OAuthIdentity)>;

    async fn find_by_provider_identity(
        &self,
        provider: &str,
        provider_subject_id: &str,
    ) -> Result<Option<OAuthIdentity>>;

    /// Ordered by `created_at`.
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OAuthIdentity>>;

    /// Removes the user's identities for `provider`.
    async fn unlink_identity(&self, user_id: Uuid, provider: &str) -> Result<User>;
}

/// Everything the auth service needs from persistence.
pub trait AccountStore: CredentialStore + IdentityLinkStore {}

impl<T: CredentialStore + IdentityLinkStore> AccountStore for T {}

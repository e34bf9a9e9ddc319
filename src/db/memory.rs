//! In-memory store for development and tests.
//!
//! All tables live behind one write lock, so each mutating call is a single
//! critical section and behaves like a serialisable transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::auth::consistency;
use crate::db::models::{NewIdentity, NewUser, OAuthIdentity, User};
use crate::db::store::{CredentialStore, IdentityLinkStore};
use crate::error::{AppError, AuthError, StoreError};
use crate::Result;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    usernames: HashMap<String, Uuid>,
    /// Insertion sequence -> identity, so iteration follows creation order.
    identities: BTreeMap<u64, OAuthIdentity>,
    identity_index: HashMap<(String, String), u64>,
    next_seq: u64,
}

impl Tables {
    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound.into())
    }

    fn identity_count(&self, user_id: Uuid) -> usize {
        self.identities.values().filter(|i| i.user_id == user_id).count()
    }

    fn insert_user(&mut self, new_user: NewUser) -> Result<User> {
        if self.usernames.contains_key(&new_user.username) {
            return Err(StoreError::DuplicateUsername.into());
        }
        let user = User::new(new_user);
        self.usernames.insert(user.username.clone(), user.id);
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn insert_identity(&mut self, user_id: Uuid, identity: NewIdentity) -> OAuthIdentity {
        let key = (identity.provider.clone(), identity.provider_subject_id.clone());
        let identity = OAuthIdentity::new(user_id, identity);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.identity_index.insert(key, seq);
        self.identities.insert(seq, identity.clone());
        identity
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        if new_user.password_hash.as_deref().map_or(true, str::is_empty) {
            return Err(AppError::invalid_input(
                "an account needs a password or a linked identity",
            ));
        }
        let mut tables = self.tables.write().await;
        let user = tables.insert_user(new_user)?;
        info!(user_id = %user.id, "user created in memory store");
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .usernames
            .get(username)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .filter(|u| u.email.as_deref() == Some(email))
            .min_by_key(|u| u.created_at)
            .cloned())
    }

    async fn set_password_hash(&self, user_id: Uuid, password_hash: Option<String>) -> Result<User> {
        let mut tables = self.tables.write().await;
        let remaining = tables.identity_count(user_id);
        let current = tables.user_mut(user_id)?;

        // Validate on a copy so a rejected transition leaves the row untouched.
        let mut updated = current.clone();
        let flags = updated.apply_password_hash(password_hash);
        consistency::ensure_recoverable(flags, remaining)?;

        *current = updated.clone();
        Ok(updated)
    }

    async fn record_login(&self, user_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.user_mut(user_id)?.last_login = Some(Utc::now());
        Ok(())
    }

    async fn set_verification_token(&self, user_id: Uuid, token_hash: String) -> Result<()> {
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.verification_token_hash = Some(token_hash);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn consume_verification_token(&self, token_hash: &str) -> Result<User> {
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .values_mut()
            .find(|u| u.verification_token_hash.as_deref() == Some(token_hash))
            .ok_or(AuthError::InvalidToken)?;
        user.verification_token_hash = None;
        user.email_verified = true;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let user = tables.user_mut(user_id)?;
        user.reset_token_hash = Some(token_hash);
        user.reset_token_expires_at = Some(expires_at);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn consume_reset_token(&self, token_hash: &str, new_password_hash: String) -> Result<User> {
        let mut tables = self.tables.write().await;
        let user = tables
            .users
            .values_mut()
            .find(|u| u.reset_token_hash.as_deref() == Some(token_hash))
            .ok_or(AuthError::InvalidToken)?;

        let expires_at = user.reset_token_expires_at.take();
        user.reset_token_hash = None;
        if expires_at.map_or(true, |at| at <= Utc::now()) {
            user.updated_at = Utc::now();
            return Err(AuthError::ExpiredToken.into());
        }

        user.apply_password_hash(Some(new_password_hash));
        Ok(user.clone())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        let user = tables.users.remove(&user_id).ok_or(StoreError::NotFound)?;
        tables.usernames.remove(&user.username);

        let doomed: Vec<u64> = tables
            .identities
            .iter()
            .filter(|(_, identity)| identity.user_id == user_id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in doomed {
            if let Some(identity) = tables.identities.remove(&seq) {
                tables
                    .identity_index
                    .remove(&(identity.provider, identity.provider_subject_id));
            }
        }
        info!(user_id = %user_id, "user deleted from memory store");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl IdentityLinkStore for MemoryStore {
    async fn link_identity(&self, user_id: Uuid, identity: NewIdentity) -> Result<OAuthIdentity> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::NotFound.into());
        }

        let key = (identity.provider.clone(), identity.provider_subject_id.clone());
        let existing = tables.identity_index.get(&key).copied();
        let linked = match existing {
            Some(seq) => {
                let stored = tables
                    .identities
                    .get_mut(&seq)
                    .ok_or_else(|| AppError::InternalError("identity index out of sync".into()))?;
                if stored.user_id != user_id {
                    return Err(StoreError::IdentityAlreadyLinked.into());
                }
                stored.refresh_from(identity);
                stored.clone()
            }
            None => tables.insert_identity(user_id, identity),
        };

        // Linking never changes the credential, but the flags are re-derived
        // on every link mutation all the same.
        let user = tables.user_mut(user_id)?;
        let hash = user.password_hash().map(str::to_string);
        user.apply_password_hash(hash);
        Ok(linked)
    }

    async fn create_user_with_identity(
        &self,
        new_user: NewUser,
        identity: NewIdentity,
    ) -> Result<(User, OAuthIdentity)> {
        let mut tables = self.tables.write().await;
        let key = (identity.provider.clone(), identity.provider_subject_id.clone());
        if tables.identity_index.contains_key(&key) {
            return Err(StoreError::IdentityAlreadyLinked.into());
        }
        let user = tables.insert_user(new_user)?;
        let linked = tables.insert_identity(user.id, identity);
        info!(user_id = %user.id, provider = %linked.provider, "oauth user created in memory store");
        Ok((user, linked))
    }

    async fn find_by_provider_identity(
        &self,
        provider: &str,
        provider_subject_id: &str,
    ) -> Result<Option<OAuthIdentity>> {
        let tables = self.tables.read().await;
        let key = (provider.to_string(), provider_subject_id.to_string());
        Ok(tables
            .identity_index
            .get(&key)
            .and_then(|seq| tables.identities.get(seq))
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        let tables = self.tables.read().await;
        Ok(tables
            .identities
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn unlink_identity(&self, user_id: Uuid, provider: &str) -> Result<User> {
        let mut tables = self.tables.write().await;
        let doomed: Vec<u64> = tables
            .identities
            .iter()
            .filter(|(_, i)| i.user_id == user_id && i.provider == provider)
            .map(|(seq, _)| *seq)
            .collect();
        if doomed.is_empty() {
            return Err(StoreError::NotFound.into());
        }

        let remaining = tables.identity_count(user_id) - doomed.len();
        let user = tables.user_mut(user_id)?;
        consistency::ensure_recoverable(consistency::recompute(user.password_hash()), remaining)?;
        let hash = user.password_hash().map(str::to_string);
        user.apply_password_hash(hash);
        let user = user.clone();

        for seq in doomed {
            if let Some(identity) = tables.identities.remove(&seq) {
                tables
                    .identity_index
                    .remove(&(identity.provider, identity.provider_subject_id));
            }
        }
        Ok(user)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::auth::consistency;
use crate::db::models::{NewIdentity, NewUser, OAuthIdentity, User, UserRow};
use crate::db::store::{CredentialStore, IdentityLinkStore};
use crate::error::{AppError, AuthError, StoreError};
use crate::Result;

const USER_COLUMNS: &str = "id, username, password_hash, email, role, email_verified, \
    verification_token_hash, reset_token_hash, reset_token_expires_at, has_password, \
    oauth_only, created_at, updated_at, last_login";

const IDENTITY_COLUMNS: &str = "id, user_id, provider, provider_subject_id, provider_email, \
    access_token, refresh_token, token_expires_at, created_at, updated_at";

const IDENTITY_CONSTRAINT: &str = "oauth_identities_provider_subject_key";

/// Maps a unique violation to the conflict it represents, anything else to
/// the generic store error.
fn map_conflict(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return match db_err.constraint() {
                Some(IDENTITY_CONSTRAINT) => StoreError::IdentityAlreadyLinked.into(),
                _ => StoreError::DuplicateUsername.into(),
            };
        }
    }
    err.into()
}

/// Postgres-backed account store.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    async fn finish<T>(&self, transaction: Transaction<'_, Postgres>, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(e) => {
                transaction.rollback().await?;
                Err(e)
            }
        }
    }

    async fn lock_user(
        &self,
        user_id: Uuid,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut **transaction)
        .await?
        .ok_or(StoreError::NotFound)?;

        User::try_from(row)
    }

    async fn insert_user_with_transaction(
        &self,
        user: &User,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            INSERT INTO users ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {columns}
            "#,
            columns = USER_COLUMNS
        ))
        .bind(user.id)
        .bind(&user.username)
        .bind(user.password_hash())
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.email_verified)
        .bind(&user.verification_token_hash)
        .bind(&user.reset_token_hash)
        .bind(user.reset_token_expires_at)
        .bind(user.has_password())
        .bind(user.oauth_only())
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.last_login)
        .fetch_one(&mut **transaction)
        .await
        .map_err(map_conflict)?;

        User::try_from(row)
    }

    /// Writes the credential and its derived flags together.
    async fn write_credential(
        &self,
        user: &User,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
            SET password_hash = $2, has_password = $3, oauth_only = $4,
                reset_token_hash = $5, reset_token_expires_at = $6, updated_at = $7
            WHERE id = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(user.id)
        .bind(user.password_hash())
        .bind(user.has_password())
        .bind(user.oauth_only())
        .bind(&user.reset_token_hash)
        .bind(user.reset_token_expires_at)
        .bind(user.updated_at)
        .fetch_one(&mut **transaction)
        .await?;

        User::try_from(row)
    }

    async fn count_identities(
        &self,
        user_id: Uuid,
        excluding_provider: Option<&str>,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM oauth_identities WHERE user_id = $1 AND ($2::TEXT IS NULL OR provider <> $2)",
        )
        .bind(user_id)
        .bind(excluding_provider)
        .fetch_one(&mut **transaction)
        .await?;

        Ok(count as usize)
    }

    async fn insert_identity_with_transaction(
        &self,
        identity: &OAuthIdentity,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<OAuthIdentity>> {
        // The upsert only touches a row owned by the same user; a pair owned by
        // someone else yields no row.
        let linked = sqlx::query_as::<_, OAuthIdentity>(&format!(
            r#"
            INSERT INTO oauth_identities ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider, provider_subject_id) DO UPDATE
            SET provider_email = EXCLUDED.provider_email,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                updated_at = EXCLUDED.updated_at
            WHERE oauth_identities.user_id = EXCLUDED.user_id
            RETURNING {columns}
            "#,
            columns = IDENTITY_COLUMNS
        ))
        .bind(identity.id)
        .bind(identity.user_id)
        .bind(&identity.provider)
        .bind(&identity.provider_subject_id)
        .bind(&identity.provider_email)
        .bind(&identity.access_token)
        .bind(&identity.refresh_token)
        .bind(identity.token_expires_at)
        .bind(identity.created_at)
        .bind(identity.updated_at)
        .fetch_optional(&mut **transaction)
        .await
        .map_err(map_conflict)?;

        Ok(linked)
    }

    async fn set_password_hash_with_transaction(
        &self,
        user_id: Uuid,
        password_hash: Option<String>,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User> {
        let mut user = self.lock_user(user_id, transaction).await?;
        let remaining = self.count_identities(user_id, None, transaction).await?;
        let flags = user.apply_password_hash(password_hash);
        consistency::ensure_recoverable(flags, remaining)?;
        self.write_credential(&user, transaction).await
    }

    async fn link_identity_with_transaction(
        &self,
        user_id: Uuid,
        identity: NewIdentity,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<OAuthIdentity> {
        let mut user = self.lock_user(user_id, transaction).await?;
        let linked = self
            .insert_identity_with_transaction(&OAuthIdentity::new(user_id, identity), transaction)
            .await?
            .ok_or(StoreError::IdentityAlreadyLinked)?;

        let hash = user.password_hash().map(str::to_string);
        user.apply_password_hash(hash);
        self.write_credential(&user, transaction).await?;
        Ok(linked)
    }

    async fn create_user_with_identity_with_transaction(
        &self,
        new_user: NewUser,
        identity: NewIdentity,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<(User, OAuthIdentity)> {
        let user = self
            .insert_user_with_transaction(&User::new(new_user), transaction)
            .await?;
        let linked = self
            .insert_identity_with_transaction(&OAuthIdentity::new(user.id, identity), transaction)
            .await?
            .ok_or(StoreError::IdentityAlreadyLinked)?;
        Ok((user, linked))
    }

    async fn unlink_identity_with_transaction(
        &self,
        user_id: Uuid,
        provider: &str,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<User> {
        let mut user = self.lock_user(user_id, transaction).await?;
        let remaining = self.count_identities(user_id, Some(provider), transaction).await?;
        consistency::ensure_recoverable(consistency::recompute(user.password_hash()), remaining)?;

        let removed = sqlx::query("DELETE FROM oauth_identities WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&mut **transaction)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(StoreError::NotFound.into());
        }

        let hash = user.password_hash().map(str::to_string);
        user.apply_password_hash(hash);
        self.write_credential(&user, transaction).await
    }

    async fn fetch_user(&self, clause: &str, value: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE {} = $1 ORDER BY created_at LIMIT 1",
            USER_COLUMNS, clause
        ))
        .bind(value)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl CredentialStore for DbOperations {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        if new_user.password_hash.as_deref().map_or(true, str::is_empty) {
            return Err(AppError::invalid_input(
                "an account needs a password or a linked identity",
            ));
        }
        let mut transaction = self.begin_transaction().await?;
        let result = self
            .insert_user_with_transaction(&User::new(new_user), &mut transaction)
            .await;
        self.finish(transaction, result).await
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        self.fetch_user("username", username).await
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.fetch_user("email", email).await
    }

    async fn set_password_hash(&self, user_id: Uuid, password_hash: Option<String>) -> Result<User> {
        let mut transaction = self.begin_transaction().await?;
        let result = self
            .set_password_hash_with_transaction(user_id, password_hash, &mut transaction)
            .await;
        self.finish(transaction, result).await
    }

    async fn record_login(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn set_verification_token(&self, user_id: Uuid, token_hash: String) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET verification_token_hash = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(token_hash)
        .bind(Utc::now())
        .bind(user_id)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound.into());
        }
        Ok(())
    }

    async fn consume_verification_token(&self, token_hash: &str) -> Result<User> {
        // Single statement: the token is cleared by the same write that reads it.
        let row = sqlx::query_as::<_, UserRow>(&format!(
            r#"
            UPDATE users
            SET verification_token_hash = NULL, email_verified = TRUE, updated_at = $2
            WHERE verification_token_hash = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(token_hash)
        .bind(Utc::now())
        .fetch_optional(self.pool.as_ref())
        .await?
        .ok_or(AuthError::InvalidToken)?;

        User::try_from(row)
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET reset_token_hash = $1, reset_token_expires_at = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(token_hash)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(user_id)
        .execute(self.pool.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound.into());
        }
        Ok(())
    }

    async fn consume_reset_token(&self, token_hash: &str, new_password_hash: String) -> Result<User> {
        let mut transaction = self.begin_transaction().await?;

        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {} FROM users WHERE reset_token_hash = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(token_hash)
        .fetch_optional(&mut *transaction)
        .await?;

        let mut user = match row {
            Some(row) => User::try_from(row)?,
            None => {
                transaction.rollback().await?;
                return Err(AuthError::InvalidToken.into());
            }
        };

        let expires_at = user.reset_token_expires_at.take();
        user.reset_token_hash = None;

        if expires_at.map_or(true, |at| at <= Utc::now()) {
            // An expired token is still burned.
            user.updated_at = Utc::now();
            self.write_credential(&user, &mut transaction).await?;
            transaction.commit().await?;
            return Err(AuthError::ExpiredToken.into());
        }

        user.apply_password_hash(Some(new_password_hash));
        let result = self.write_credential(&user, &mut transaction).await;
        self.finish(transaction, result).await
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound.into());
        }
        info!(user_id = %user_id, "user deleted");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityLinkStore for DbOperations {
    async fn link_identity(&self, user_id: Uuid, identity: NewIdentity) -> Result<OAuthIdentity> {
        let mut transaction = self.begin_transaction().await?;
        let result = self
            .link_identity_with_transaction(user_id, identity, &mut transaction)
            .await;
        self.finish(transaction, result).await
    }

    async fn create_user_with_identity(
        &self,
        new_user: NewUser,
        identity: NewIdentity,
    ) -> Result<(User, OAuthIdentity)> {
        let mut transaction = self.begin_transaction().await?;
        let result = self
            .create_user_with_identity_with_transaction(new_user, identity, &mut transaction)
            .await;
        self.finish(transaction, result).await
    }

    async fn find_by_provider_identity(
        &self,
        provider: &str,
        provider_subject_id: &str,
    ) -> Result<Option<OAuthIdentity>> {
        let identity = sqlx::query_as::<_, OAuthIdentity>(&format!(
            "SELECT {} FROM oauth_identities WHERE provider = $1 AND provider_subject_id = $2",
            IDENTITY_COLUMNS
        ))
        .bind(provider)
        .bind(provider_subject_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(identity)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        let identities = sqlx::query_as::<_, OAuthIdentity>(&format!(
            "SELECT {} FROM oauth_identities WHERE user_id = $1 ORDER BY created_at, id",
            IDENTITY_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(identities)
    }

    async fn unlink_identity(&self, user_id: Uuid, provider: &str) -> Result<User> {
        let mut transaction = self.begin_transaction().await?;
        let result = self
            .unlink_identity_with_transaction(user_id, provider, &mut transaction)
            .await;
        self.finish(transaction, result).await
    }
}

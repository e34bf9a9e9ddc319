use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::consistency::{self, CredentialFlags};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(AppError::InternalError(format!("unknown role: {}", other))),
        }
    }
}

/// A local account. The derived credential flags are private and only move
/// together with the password credential.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    password_hash: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    pub email_verified: bool,
    pub verification_token_hash: Option<String>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<DateTime<Utc>>,
    has_password: bool,
    oauth_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(new_user: NewUser) -> Self {
        let now = Utc::now();
        let mut user = Self {
            id: Uuid::new_v4(),
            username: new_user.username,
            password_hash: None,
            email: new_user.email,
            role: new_user.role,
            email_verified: false,
            verification_token_hash: new_user.verification_token_hash,
            reset_token_hash: None,
            reset_token_expires_at: None,
            has_password: false,
            oauth_only: true,
            created_at: now,
            updated_at: now,
            last_login: None,
        };
        user.apply_password_hash(new_user.password_hash);
        user
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    pub fn has_password(&self) -> bool {
        self.has_password
    }

    pub fn oauth_only(&self) -> bool {
        self.oauth_only
    }

    /// Replaces the credential and re-derives both flags in one step.
    pub fn apply_password_hash(&mut self, password_hash: Option<String>) -> CredentialFlags {
        let password_hash = password_hash.filter(|hash| !hash.is_empty());
        let flags = consistency::recompute(password_hash.as_deref());
        self.password_hash = password_hash;
        self.has_password = flags.has_password;
        self.oauth_only = flags.oauth_only;
        self.updated_at = Utc::now();
        flags
    }

    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

/// Input to account creation; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    pub verification_token_hash: Option<String>,
}

/// Row shape of the `users` table. The stored flags are ignored on read and
/// re-derived from the credential.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: Option<String>,
    pub email: Option<String>,
    pub role: String,
    pub email_verified: bool,
    pub verification_token_hash: Option<String>,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<DateTime<Utc>>,
    pub has_password: bool,
    pub oauth_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for User {
    type Error = AppError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let flags = consistency::recompute(row.password_hash.as_deref());
        if flags.has_password != row.has_password || flags.oauth_only != row.oauth_only {
            tracing::warn!(user_id = %row.id, "stored credential flags disagree with credential, re-deriving");
        }
        Ok(Self {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash.filter(|hash| !hash.is_empty()),
            email: row.email,
            role: row.role.parse()?,
            email_verified: row.email_verified,
            verification_token_hash: row.verification_token_hash,
            reset_token_hash: row.reset_token_hash,
            reset_token_expires_at: row.reset_token_expires_at,
            has_password: flags.has_password,
            oauth_only: flags.oauth_only,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_login: row.last_login,
        })
    }
}

/// Fields safe to hand to any caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OAuthIdentity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_subject_id: String,
    pub provider_email: Option<String>,
    /// Encrypted at rest, see `crypto::TokenCipher`.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthIdentity {
    pub fn new(user_id: Uuid, identity: NewIdentity) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider: identity.provider,
            provider_subject_id: identity.provider_subject_id,
            provider_email: identity.provider_email,
            access_token: identity.access_token,
            refresh_token: identity.refresh_token,
            token_expires_at: identity.token_expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Upsert path for a pair already owned by the same user.
    pub fn refresh_from(&mut self, identity: NewIdentity) {
        self.provider_email = identity.provider_email;
        self.access_token = identity.access_token;
        self.refresh_token = identity.refresh_token;
        self.token_expires_at = identity.token_expires_at;
        self.updated_at = Utc::now();
    }
}

/// Result of a provider handshake, with provider tokens already encrypted.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub provider: String,
    pub provider_subject_id: String,
    pub provider_email: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

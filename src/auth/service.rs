use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::notify::{LogNotifier, Notifier};
use crate::auth::password::PasswordService;
use crate::auth::rate_limit::{RateLimitConfig, RateLimitScope, RateLimiter};
use crate::auth::token::{Claims, TokenService};
use crate::config::{Settings, DEVELOPMENT_JWT_SECRET};
use crate::crypto::{self, TokenCipher};
use crate::db::models::{NewIdentity, NewUser, OAuthIdentity, PublicUser, Role, User};
use crate::db::store::AccountStore;
use crate::error::{AppError, AuthError, StoreError};
use crate::Result;

const MAX_USERNAME_LENGTH: usize = 64;
const MAX_PROVIDER_LENGTH: usize = 32;
const SHELL_USERNAME_ATTEMPTS: usize = 5;
pub const DELETE_CONFIRMATION: &str = "DELETE";

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// The outcome of a provider handshake, as reported by the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkRequest {
    pub provider: String,
    pub provider_subject_id: String,
    pub provider_email: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
    pub user: PublicUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOutcome {
    /// The identity already belonged to an account, which is now logged in.
    Authenticated,
    /// The identity was attached to the caller's account.
    Linked,
    /// A new OAuth-only account was created around the identity.
    Created,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResponse {
    pub outcome: LinkOutcome,
    #[serde(flatten)]
    pub session: AuthResponse,
    pub identity: OAuthIdentity,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub email_verified: bool,
    pub has_password: bool,
    pub oauth_only: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub identities: Vec<OAuthIdentity>,
}

/// Decrypted provider tokens for one linked identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: &'static str,
    pub timestamp: DateTime<Utc>,
}

pub struct AuthService {
    store: Arc<dyn AccountStore>,
    tokens: TokenService,
    passwords: PasswordService,
    rate_limiter: Arc<RateLimiter>,
    cipher: TokenCipher,
    notifier: Arc<dyn Notifier>,
    store_timeout: Duration,
    reset_token_ttl: chrono::Duration,
    bridge_key_digest: Option<String>,
}

impl AuthService {
    pub fn from_settings(settings: &Settings, store: Arc<dyn AccountStore>) -> Result<Self> {
        let auth = &settings.auth;
        if auth.jwt_secret.is_empty() {
            return Err(AppError::ConfigError("auth.jwt_secret must not be empty".to_string()));
        }
        if settings.is_production() && auth.jwt_secret == DEVELOPMENT_JWT_SECRET {
            return Err(AppError::ConfigError(
                "auth.jwt_secret must be set in production".to_string(),
            ));
        }

        let cipher = match auth.token_encryption_key.as_deref() {
            Some(key) => TokenCipher::from_base64_key(key)?,
            None if settings.is_production() => {
                return Err(AppError::ConfigError(
                    "auth.token_encryption_key is required in production".to_string(),
                ));
            }
            None => {
                warn!("no token encryption key configured, provider tokens will not survive a restart");
                TokenCipher::ephemeral()
            }
        };

        Ok(Self {
            store,
            tokens: TokenService::from_config(auth),
            passwords: PasswordService::new(auth.bcrypt_cost, auth.min_password_length)?,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::from(&settings.rate_limit))),
            cipher,
            notifier: Arc::new(LogNotifier),
            store_timeout: settings.database.operation_timeout(),
            reset_token_ttl: chrono::Duration::minutes(auth.reset_token_ttl_minutes),
            bridge_key_digest: auth
                .bridge_key
                .as_deref()
                .filter(|key| !key.is_empty())
                .map(crypto::digest_token),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    pub async fn register(&self, client: &str, request: RegisterRequest) -> Result<AuthResponse> {
        let username = validate_username(&request.username)?;
        self.passwords.validate(&request.password)?;
        let email = normalize_email(request.email.as_deref())?;

        self.admit(RateLimitScope::Register, client).await?;

        let verification_token = email.as_ref().map(|_| crypto::generate_token());
        let password_hash = self.hash_password(&request.password).await?;
        let user = self
            .bounded(
                "create_user",
                self.store.create_user(NewUser {
                    username,
                    password_hash: Some(password_hash),
                    email: email.clone(),
                    role: Role::User,
                    verification_token_hash: verification_token.as_deref().map(crypto::digest_token),
                }),
            )
            .await?;
        info!(user_id = %user.id, "user registered");

        if let (Some(email), Some(token)) = (email, verification_token) {
            if let Err(e) = self.notifier.send_verification(&user, &email, &token).await {
                warn!(user_id = %user.id, error = %e, "failed to send verification email");
            }
        }

        self.session_for(&user, false)
    }

    pub async fn login(&self, client: &str, request: LoginRequest) -> Result<AuthResponse> {
        // Throttle before anything touches the store.
        self.admit(RateLimitScope::Login, client).await?;

        let username = request.username.trim();
        if username.is_empty() || request.password.is_empty() {
            return Err(AppError::invalid_input("username and password are required"));
        }

        let user = self
            .bounded("find_by_username", self.store.find_by_username(username))
            .await?;
        let stored_hash = user.as_ref().and_then(|u| u.password_hash()).map(str::to_string);
        let matches = self.verify_password(&request.password, stored_hash).await?;

        let user = match user {
            Some(user) if matches => user,
            _ => {
                warn!(client = %client, "login rejected");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let response = self.session_for(&user, request.remember_me)?;
        self.record_login_in_background(user.id);
        info!(user_id = %user.id, remember_me = request.remember_me, "user logged in");
        Ok(response)
    }

    /// Pure token check; never touches the store.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        self.tokens.verify(token)
    }

    /// Tokens are stateless, so there is nothing to revoke. A presented token
    /// is only used to attribute the log line.
    pub fn logout(&self, token: Option<&str>) {
        match token.map(|t| self.tokens.verify(t)) {
            Some(Ok(claims)) => info!(user_id = %claims.sub, "user logged out"),
            _ => info!("anonymous logout"),
        }
    }

    /// Issues a fresh default-lifetime token from the current account state.
    pub async fn refresh(&self, token: &str) -> Result<AuthResponse> {
        let claims = self.tokens.verify(token)?;
        let user = self.load_user(claims.user_id()?).await?;
        info!(user_id = %user.id, "token refreshed");
        self.session_for(&user, false)
    }

    /// The link endpoint trusts the subject id it is handed, so only the
    /// handshake bridge may call it.
    pub fn check_bridge_key(&self, presented: Option<&str>) -> Result<()> {
        let Some(expected) = self.bridge_key_digest.as_deref() else {
            return Err(AuthError::Forbidden("identity linking is disabled".to_string()).into());
        };
        match presented {
            Some(key) if crypto::digest_token(key) == expected => Ok(()),
            _ => Err(AuthError::Forbidden("invalid bridge key".to_string()).into()),
        }
    }

    pub async fn link_oauth_identity(
        &self,
        request: LinkRequest,
        existing_user: Option<Uuid>,
    ) -> Result<LinkResponse> {
        let identity = self.new_identity(request)?;

        let known = self
            .bounded(
                "find_by_provider_identity",
                self.store
                    .find_by_provider_identity(&identity.provider, &identity.provider_subject_id),
            )
            .await?;
        if let Some(known) = known {
            if existing_user.map_or(false, |id| id != known.user_id) {
                info!(
                    provider = %identity.provider,
                    owner = %known.user_id,
                    "identity belongs to another account, logging in as its owner"
                );
            }
            return self.authenticate_linked(known.user_id, identity).await;
        }

        let (outcome, user, linked) = match existing_user {
            Some(user_id) => {
                let user = self.load_user(user_id).await?;
                let linked = self
                    .bounded("link_identity", self.store.link_identity(user_id, identity.clone()))
                    .await;
                match linked {
                    Ok(linked) => (LinkOutcome::Linked, user, linked),
                    Err(AppError::StoreError(StoreError::IdentityAlreadyLinked)) => {
                        return self.resolve_lost_race(identity).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            None => match self.create_shell_user(identity.clone()).await {
                Ok((user, linked)) => (LinkOutcome::Created, user, linked),
                Err(AppError::StoreError(StoreError::IdentityAlreadyLinked)) => {
                    return self.resolve_lost_race(identity).await;
                }
                Err(e) => return Err(e),
            },
        };

        info!(user_id = %user.id, provider = %linked.provider, outcome = ?outcome, "identity linked");
        Ok(LinkResponse {
            outcome,
            session: self.session_for(&user, false)?,
            identity: linked,
        })
    }

    pub async fn unlink_identity(&self, user_id: Uuid, provider: &str) -> Result<User> {
        let provider = normalize_provider(provider)?;
        let user = self
            .bounded("unlink_identity", self.store.unlink_identity(user_id, &provider))
            .await?;
        info!(user_id = %user_id, provider = %provider, "identity unlinked");
        Ok(user)
    }

    pub async fn list_identities(&self, user_id: Uuid) -> Result<Vec<OAuthIdentity>> {
        self.bounded("list_for_user", self.store.list_for_user(user_id)).await
    }

    pub async fn provider_tokens(&self, user_id: Uuid, provider: &str) -> Result<ProviderTokens> {
        let provider = normalize_provider(provider)?;
        let identity = self
            .list_identities(user_id)
            .await?
            .into_iter()
            .find(|identity| identity.provider == provider)
            .ok_or(StoreError::NotFound)?;

        Ok(ProviderTokens {
            access_token: identity.access_token.as_deref().map(|t| self.cipher.open(t)).transpose()?,
            refresh_token: identity.refresh_token.as_deref().map(|t| self.cipher.open(t)).transpose()?,
            expires_at: identity.token_expires_at,
        })
    }

    /// Password users must prove the current password; OAuth-only users add
    /// their first credential without one.
    pub async fn set_password(
        &self,
        user_id: Uuid,
        current_password: Option<&str>,
        new_password: &str,
    ) -> Result<User> {
        self.passwords.validate(new_password)?;
        let user = self.load_user(user_id).await?;

        if user.has_password() {
            let current = current_password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| AppError::invalid_input("current password is required"))?;
            if !self.verify_password(current, user.password_hash().map(str::to_string)).await? {
                return Err(AuthError::InvalidCredentials.into());
            }
            if current == new_password {
                return Err(AppError::invalid_input("new password must differ from the current one"));
            }
        }

        let hash = self.hash_password(new_password).await?;
        let user = self
            .bounded("set_password_hash", self.store.set_password_hash(user_id, Some(hash)))
            .await?;
        info!(user_id = %user_id, "password set");
        Ok(user)
    }

    pub async fn clear_password(&self, user_id: Uuid, current_password: &str) -> Result<User> {
        let user = self.load_user(user_id).await?;
        if !user.has_password() {
            return Err(AppError::invalid_input("account has no password"));
        }
        if !self
            .verify_password(current_password, user.password_hash().map(str::to_string))
            .await?
        {
            return Err(AuthError::InvalidCredentials.into());
        }

        let user = self
            .bounded("set_password_hash", self.store.set_password_hash(user_id, None))
            .await?;
        info!(user_id = %user_id, "password cleared");
        Ok(user)
    }

    /// Always succeeds for a well-formed email so callers cannot probe which
    /// addresses have accounts.
    pub async fn request_password_reset(&self, client: &str, email: &str) -> Result<()> {
        self.admit(RateLimitScope::Recovery, client).await?;
        let email = normalize_email(Some(email))?
            .ok_or_else(|| AppError::invalid_input("email is required"))?;

        let Some(user) = self.bounded("find_by_email", self.store.find_by_email(&email)).await? else {
            info!("password reset requested for unknown email");
            return Ok(());
        };

        let token = crypto::generate_token();
        let expires_at = Utc::now() + self.reset_token_ttl;
        self.bounded(
            "set_reset_token",
            self.store.set_reset_token(user.id, crypto::digest_token(&token), expires_at),
        )
        .await?;

        if let Err(e) = self.notifier.send_password_reset(&user, &email, &token).await {
            warn!(user_id = %user.id, error = %e, "failed to send password reset email");
        }
        info!(user_id = %user.id, "password reset requested");
        Ok(())
    }

    pub async fn reset_password(&self, client: &str, token: &str, new_password: &str) -> Result<User> {
        self.admit(RateLimitScope::Recovery, client).await?;
        if token.is_empty() {
            return Err(AuthError::InvalidToken.into());
        }
        self.passwords.validate(new_password)?;

        let hash = self.hash_password(new_password).await?;
        let user = self
            .bounded(
                "consume_reset_token",
                self.store.consume_reset_token(&crypto::digest_token(token), hash),
            )
            .await?;
        info!(user_id = %user.id, "password reset completed");
        Ok(user)
    }

    pub async fn verify_email(&self, client: &str, token: &str) -> Result<User> {
        self.admit(RateLimitScope::Recovery, client).await?;
        if token.is_empty() {
            return Err(AuthError::InvalidToken.into());
        }

        let user = self
            .bounded(
                "consume_verification_token",
                self.store.consume_verification_token(&crypto::digest_token(token)),
            )
            .await?;
        info!(user_id = %user.id, "email verified");
        Ok(user)
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Profile> {
        let user = self.load_user(user_id).await?;
        let identities = self.list_identities(user_id).await?;

        Ok(Profile {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            email_verified: user.email_verified,
            has_password: user.has_password(),
            oauth_only: user.oauth_only(),
            created_at: user.created_at,
            last_login: user.last_login,
            identities,
        })
    }

    /// Tokens issued to the account stay valid until they expire.
    pub async fn delete_account(
        &self,
        user_id: Uuid,
        password: Option<&str>,
        confirm_text: &str,
    ) -> Result<()> {
        if confirm_text != DELETE_CONFIRMATION {
            return Err(AppError::invalid_input(format!(
                "confirm_text must be \"{}\"",
                DELETE_CONFIRMATION
            )));
        }

        let user = self.load_user(user_id).await?;
        if user.has_password() {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| AppError::invalid_input("password is required"))?;
            if !self.verify_password(password, user.password_hash().map(str::to_string)).await? {
                return Err(AuthError::InvalidCredentials.into());
            }
        }

        self.bounded("delete_user", self.store.delete_user(user_id)).await?;
        info!(user_id = %user_id, "account deleted");
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let store = match self.bounded("ping", self.store.ping()).await {
            Ok(()) => "up",
            Err(e) => {
                warn!(error = %e, "store health check failed");
                "down"
            }
        };

        HealthReport {
            status: if store == "up" { "healthy" } else { "degraded" },
            store,
            timestamp: Utc::now(),
        }
    }

    async fn admit(&self, scope: RateLimitScope, client: &str) -> Result<()> {
        self.rate_limiter
            .check_rate_limit(scope, client)
            .await
            .map_err(|retry_after_secs| {
                warn!(client = %client, scope = ?scope, "rate limit exceeded");
                AuthError::RateLimited { retry_after_secs }.into()
            })
    }

    /// Bounds a store call; an elapsed deadline surfaces as `Unavailable`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "store operation timed out");
                Err(StoreError::Unavailable(format!("{} timed out", operation)).into())
            }
        }
    }

    /// Token-authenticated callers whose account is gone get the same
    /// answer as a bad credential.
    async fn load_user(&self, user_id: Uuid) -> Result<User> {
        self.bounded("find_by_id", self.store.find_by_id(user_id))
            .await?
            .ok_or_else(|| AuthError::InvalidCredentials.into())
    }

    fn session_for(&self, user: &User, remember_me: bool) -> Result<AuthResponse> {
        let issued = self.tokens.issue(user, remember_me)?;
        Ok(AuthResponse {
            token: issued.token,
            expires_at: issued.expires_at,
            expires_in: issued.expires_in,
            user: user.to_public(),
        })
    }

    fn record_login_in_background(&self, user_id: Uuid) {
        let store = Arc::clone(&self.store);
        let limit = self.store_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(limit, store.record_login(user_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(user_id = %user_id, error = %e, "failed to record login"),
                Err(_) => warn!(user_id = %user_id, "recording login timed out"),
            }
        });
    }

    async fn hash_password(&self, password: &str) -> Result<String> {
        let passwords = self.passwords.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || passwords.hash(&password))
            .await
            .map_err(|e| AppError::InternalError(format!("Hashing task failed: {}", e)))?
    }

    /// Without a stored hash the dummy hash is checked instead, so a missing
    /// account costs the same as a wrong password.
    async fn verify_password(&self, password: &str, hash: Option<String>) -> Result<bool> {
        let passwords = self.passwords.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || match hash {
            Some(hash) => passwords.verify(&password, &hash),
            None => {
                passwords.verify_against_dummy(&password);
                false
            }
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Verification task failed: {}", e)))
    }

    fn new_identity(&self, request: LinkRequest) -> Result<NewIdentity> {
        let provider = normalize_provider(&request.provider)?;
        let provider_subject_id = request.provider_subject_id.trim().to_string();
        if provider_subject_id.is_empty() {
            return Err(AppError::invalid_input("provider_subject_id is required"));
        }

        Ok(NewIdentity {
            provider,
            provider_subject_id,
            provider_email: normalize_email(request.provider_email.as_deref()).ok().flatten(),
            access_token: self.seal(request.access_token)?,
            refresh_token: self.seal(request.refresh_token)?,
            token_expires_at: request.token_expires_at,
        })
    }

    fn seal(&self, token: Option<String>) -> Result<Option<String>> {
        token
            .filter(|t| !t.is_empty())
            .map(|t| self.cipher.seal(&t))
            .transpose()
    }

    /// Refreshes the stored provider tokens and logs the owner in.
    async fn authenticate_linked(&self, owner: Uuid, identity: NewIdentity) -> Result<LinkResponse> {
        let user = self.load_user(owner).await?;
        let linked = self
            .bounded("link_identity", self.store.link_identity(owner, identity))
            .await?;
        self.record_login_in_background(owner);
        info!(user_id = %owner, provider = %linked.provider, "user logged in via identity");

        Ok(LinkResponse {
            outcome: LinkOutcome::Authenticated,
            session: self.session_for(&user, false)?,
            identity: linked,
        })
    }

    /// Another request claimed the pair first; follow the mapping it created.
    async fn resolve_lost_race(&self, identity: NewIdentity) -> Result<LinkResponse> {
        let winner = self
            .bounded(
                "find_by_provider_identity",
                self.store
                    .find_by_provider_identity(&identity.provider, &identity.provider_subject_id),
            )
            .await?
            .ok_or(StoreError::IdentityAlreadyLinked)?;
        self.authenticate_linked(winner.user_id, identity).await
    }

    async fn create_shell_user(&self, identity: NewIdentity) -> Result<(User, OAuthIdentity)> {
        let base = shell_username(&identity);
        let mut username = base.clone();

        for _ in 0..SHELL_USERNAME_ATTEMPTS {
            let created = self
                .bounded(
                    "create_user_with_identity",
                    self.store.create_user_with_identity(
                        NewUser {
                            username: username.clone(),
                            password_hash: None,
                            email: identity.provider_email.clone(),
                            role: Role::User,
                            verification_token_hash: None,
                        },
                        identity.clone(),
                    ),
                )
                .await;
            match created {
                Err(AppError::StoreError(StoreError::DuplicateUsername)) => {
                    username = format!("{}_{:06x}", base, rand::thread_rng().gen_range(0..0x0100_0000u32));
                }
                other => return other,
            }
        }

        Err(StoreError::DuplicateUsername.into())
    }
}

fn validate_username(username: &str) -> Result<String> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::invalid_input("username is required"));
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(AppError::invalid_input(format!(
            "username must be at most {} characters",
            MAX_USERNAME_LENGTH
        )));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::invalid_input("username must not contain whitespace"));
    }
    Ok(username.to_string())
}

/// Empty means absent.
fn normalize_email(email: Option<&str>) -> Result<Option<String>> {
    let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(None);
    };
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(Some(email.to_string())),
        _ => Err(AppError::invalid_input("email is not valid")),
    }
}

fn normalize_provider(provider: &str) -> Result<String> {
    let provider = provider.trim().to_ascii_lowercase();
    let valid = !provider.is_empty()
        && provider.len() <= MAX_PROVIDER_LENGTH
        && provider
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(AppError::invalid_input("provider is not valid"));
    }
    Ok(provider)
}

/// `<email local part or subject>_<provider>`, trimmed to fit a username.
fn shell_username(identity: &NewIdentity) -> String {
    let source = identity
        .provider_email
        .as_deref()
        .and_then(|email| email.split('@').next())
        .filter(|local| !local.is_empty())
        .unwrap_or(identity.provider_subject_id.as_str());

    let base: String = source
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(24)
        .collect();
    let base = if base.is_empty() { "user".to_string() } else { base };
    format!("{}_{}", base, identity.provider)
}

//! Stateless bearer tokens.
//!
//! Tokens are HS256 JWTs over the full claim set. There is no revocation
//! list: a token stays valid until `exp` regardless of logout, password change
//! or account deletion.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::db::models::{Role, User};
use crate::error::{AppError, AuthError};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // User ID
    pub username: String,
    pub role: Role,
    pub iat: i64,     // Issued at
    pub exp: i64,     // Expiration time
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::MalformedToken.into())
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    default_lifetime: Duration,
    remember_me_lifetime: Duration,
}

impl TokenService {
    pub fn new(secret: &str, default_lifetime: Duration, remember_me_lifetime: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            default_lifetime,
            remember_me_lifetime,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.jwt_secret,
            Duration::hours(config.token_expiry_hours),
            Duration::days(config.remember_me_days),
        )
    }

    /// 24 hours by default, the remember-me lifetime when requested.
    pub fn issue(&self, user: &User, remember_me: bool) -> Result<IssuedToken> {
        let lifetime = if remember_me {
            self.remember_me_lifetime
        } else {
            self.default_lifetime
        };
        self.issue_with_lifetime(user, lifetime)
    }

    pub fn issue_with_lifetime(&self, user: &User, lifetime: Duration) -> Result<IssuedToken> {
        let now = Utc::now();
        let expires_at = now + lifetime;
        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::InternalError(format!("Token signing failed: {}", e)))?;

        Ok(IssuedToken {
            token,
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or(expires_at),
            expires_in: lifetime.num_seconds(),
        })
    }

    /// Pure check: structure and signature first, then expiry.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

/// External message shared by every 401-class failure so callers cannot tell
/// which part of a credential or token check failed.
pub const AUTHENTICATION_FAILED: &str = "Authentication failed";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        AppError::ValidationError(message.into())
    }

    /// Stable machine-readable code rendered next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => "invalid_credentials",
                AuthError::TokenExpired => "token_expired",
                AuthError::MalformedToken => "token_malformed",
                AuthError::SignatureInvalid => "token_signature_invalid",
                AuthError::Forbidden(_) => "forbidden",
                AuthError::RateLimited { .. } => "rate_limited",
                AuthError::InvalidToken => "invalid_token",
                AuthError::ExpiredToken => "expired_token",
            },
            AppError::StoreError(e) => match e {
                StoreError::DuplicateUsername => "duplicate_username",
                StoreError::IdentityAlreadyLinked => "identity_already_linked",
                StoreError::LastCredentialRemoved => "last_credential_removed",
                StoreError::NotFound => "not_found",
                StoreError::Unavailable(_) => "store_unavailable",
                StoreError::QueryError(_) => "store_error",
            },
            AppError::ValidationError(_) => "invalid_input",
            AppError::ConfigError(_) => "config_error",
            AppError::InternalError(_) => "internal_error",
        }
    }

    fn external_message(&self) -> String {
        match self {
            e if e.status_code() == StatusCode::UNAUTHORIZED => AUTHENTICATION_FAILED.to_string(),
            AppError::StoreError(StoreError::Unavailable(_)) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::StoreError(StoreError::QueryError(_))
            | AppError::InternalError(_)
            | AppError::ConfigError(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Implement conversion from sqlx::Error
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::StoreError(StoreError::NotFound),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => {
                AppError::StoreError(StoreError::Unavailable(err.to_string()))
            }
            _ => AppError::StoreError(StoreError::QueryError(err.to_string())),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::StoreError(StoreError::QueryError(err.to_string()))
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let auth_error = match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::SignatureInvalid,
            _ => AuthError::MalformedToken,
        };
        AppError::AuthError(auth_error)
    }
}

// Implement actix_web::ResponseError for AppError
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "code": self.code(),
                "message": self.external_message()
            }
        });

        let mut builder = HttpResponse::build(status);
        if let AppError::AuthError(AuthError::RateLimited { retry_after_secs }) = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            builder.insert_header(("WWW-Authenticate", "Bearer"));
        }
        builder.json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
                AuthError::MalformedToken => StatusCode::UNAUTHORIZED,
                AuthError::SignatureInvalid => StatusCode::UNAUTHORIZED,
                AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
                AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                AuthError::InvalidToken => StatusCode::BAD_REQUEST,
                AuthError::ExpiredToken => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StoreError(StoreError::NotFound) => StatusCode::NOT_FOUND,
            AppError::StoreError(StoreError::DuplicateUsername)
            | AppError::StoreError(StoreError::IdentityAlreadyLinked)
            | AppError::StoreError(StoreError::LastCredentialRemoved) => StatusCode::CONFLICT,
            AppError::StoreError(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::StoreError(StoreError::QueryError(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Malformed token")]
    MalformedToken,

    #[error("Token signature invalid")]
    SignatureInvalid,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A verification or reset token that is unknown or already used.
    #[error("Invalid or already used token")]
    InvalidToken,

    /// A reset token presented after its expiry.
    #[error("Token has expired")]
    ExpiredToken,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Username already exists")]
    DuplicateUsername,

    #[error("Identity is already linked to another account")]
    IdentityAlreadyLinked,

    #[error("Account must keep a password or at least one linked identity")]
    LastCredentialRemoved,

    #[error("Record not found")]
    NotFound,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

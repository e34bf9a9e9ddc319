use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth::service::{LinkRequest, LoginRequest, RegisterRequest};
use crate::auth::token::Claims;
use crate::error::{AppError, AuthError};
use crate::{AppState, Result};

pub const BRIDGE_KEY_HEADER: &str = "X-Bridge-Key";

#[derive(Debug, Deserialize)]
pub struct UnlinkRequest {
    pub provider: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub current_password: Option<String>,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ClearPasswordRequest {
    pub current_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub password: Option<String>,
    pub confirm_text: String,
}

/// Mounts the auth API under `/api/auth`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .app_data(json_config())
            .route("/register", web::post().to(register))
            .route("/login", web::post().to(login))
            .route("/verify", web::get().to(verify))
            .route("/logout", web::post().to(logout))
            .route("/refresh", web::post().to(refresh))
            .route("/oauth/link", web::post().to(link_identity))
            .route("/identities", web::get().to(list_identities))
            .route("/identities/unlink", web::post().to(unlink_identity))
            .route("/password/set", web::post().to(set_password))
            .route("/password/clear", web::post().to(clear_password))
            .route("/forgot-password", web::post().to(forgot_password))
            .route("/reset-password", web::post().to(reset_password))
            .route("/verify-email", web::post().to(verify_email))
            .route("/profile", web::get().to(profile))
            .route("/account", web::delete().to(delete_account)),
    );
}

/// Unparseable bodies answer like any other invalid input.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::invalid_input(err.to_string()).into())
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn authenticate(req: &HttpRequest, state: &AppState) -> Result<Claims> {
    let token = bearer_token(req).ok_or(AuthError::MalformedToken)?;
    state.auth_service.verify(token)
}

/// Rate-limit key: the peer address, or the first forwarded address when the
/// deployment sits behind a trusted proxy.
fn client_key(req: &HttpRequest, state: &AppState) -> String {
    if state.config.server.trust_forwarded_for {
        if let Some(addr) = req.connection_info().realip_remote_addr() {
            return addr.to_string();
        }
    }
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn credential_state(message: &str, user: &crate::db::models::User) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": message,
        "has_password": user.has_password(),
        "oauth_only": user.oauth_only(),
    }))
}

pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let client = client_key(&req, &state);
    debug!(client = %client, "registration request");
    let response = state.auth_service.register(&client, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(response))
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let client = client_key(&req, &state);
    debug!(client = %client, "login request");
    let response = state.auth_service.login(&client, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn verify(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    Ok(HttpResponse::Ok().json(json!({
        "valid": true,
        "user_id": claims.sub,
        "username": claims.username,
        "role": claims.role,
        "issued_at": claims.iat,
        "expires_at": claims.exp,
    })))
}

pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    state.auth_service.logout(bearer_token(&req));
    HttpResponse::Ok().json(json!({
        "message": "Successfully logged out"
    }))
}

pub async fn refresh(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let token = bearer_token(&req).ok_or(AuthError::MalformedToken)?;
    let response = state.auth_service.refresh(token).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn link_identity(
    req: HttpRequest,
    body: web::Json<LinkRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let bridge_key = req
        .headers()
        .get(BRIDGE_KEY_HEADER)
        .and_then(|h| h.to_str().ok());
    state.auth_service.check_bridge_key(bridge_key)?;

    // A presented token must be valid; no token means a first-link login.
    let existing_user = match bearer_token(&req) {
        Some(token) => Some(state.auth_service.verify(token)?.user_id()?),
        None => None,
    };

    let response = state
        .auth_service
        .link_oauth_identity(body.into_inner(), existing_user)
        .await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn list_identities(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    let identities = state.auth_service.list_identities(claims.user_id()?).await?;
    Ok(HttpResponse::Ok().json(json!({ "identities": identities })))
}

pub async fn unlink_identity(
    req: HttpRequest,
    body: web::Json<UnlinkRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    let user = state
        .auth_service
        .unlink_identity(claims.user_id()?, &body.provider)
        .await?;
    Ok(credential_state("Identity unlinked", &user))
}

pub async fn set_password(
    req: HttpRequest,
    body: web::Json<SetPasswordRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    let user = state
        .auth_service
        .set_password(
            claims.user_id()?,
            body.current_password.as_deref(),
            &body.new_password,
        )
        .await?;
    Ok(credential_state("Password set", &user))
}

pub async fn clear_password(
    req: HttpRequest,
    body: web::Json<ClearPasswordRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    let user = state
        .auth_service
        .clear_password(claims.user_id()?, &body.current_password)
        .await?;
    Ok(credential_state("Password removed", &user))
}

pub async fn forgot_password(
    req: HttpRequest,
    body: web::Json<ForgotPasswordRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let client = client_key(&req, &state);
    state
        .auth_service
        .request_password_reset(&client, &body.email)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "If that email is registered, a reset link has been sent"
    })))
}

pub async fn reset_password(
    req: HttpRequest,
    body: web::Json<ResetPasswordRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let client = client_key(&req, &state);
    let user = state
        .auth_service
        .reset_password(&client, &body.token, &body.new_password)
        .await?;
    Ok(credential_state("Password has been reset", &user))
}

pub async fn verify_email(
    req: HttpRequest,
    body: web::Json<VerifyEmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let client = client_key(&req, &state);
    let user = state.auth_service.verify_email(&client, &body.token).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Email verified",
        "email_verified": user.email_verified,
    })))
}

pub async fn profile(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    let profile = state.auth_service.profile(claims.user_id()?).await?;
    Ok(HttpResponse::Ok().json(profile))
}

pub async fn delete_account(
    req: HttpRequest,
    body: web::Json<DeleteAccountRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let claims = authenticate(&req, &state)?;
    state
        .auth_service
        .delete_account(
            claims.user_id()?,
            body.password.as_deref(),
            &body.confirm_text,
        )
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Account deleted"
    })))
}

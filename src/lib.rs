pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;

use std::sync::Arc;
use actix_web::{web, HttpResponse};
use tracing::info;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::{Settings, StoreBackend};

pub use auth::{AuthService, RateLimiter, RateLimitConfig};
pub use db::{AccountStore, DbOperations, MemoryStore};

/// Health check endpoint handler
/// Returns a JSON response with server status, store status and timestamp
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let report = state.auth_service.health().await;
    if report.status == "healthy" {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth_service: Arc<AuthService>,
}

impl AppState {
    /// Builds the configured store; Postgres schemas are migrated on start.
    pub async fn new(config: Settings) -> Result<Self> {
        let store: Arc<dyn AccountStore> = match config.database.backend {
            StoreBackend::Postgres => {
                let db = DbOperations::new_with_options(
                    &config.database.url,
                    config.database.max_connections,
                    config.database.acquire_timeout(),
                )
                .await?;
                db.migrate().await?;
                info!("Connected to Postgres store");
                Arc::new(db)
            }
            StoreBackend::Memory => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        Self::with_store(config, store)
    }

    pub fn with_store(config: Settings, store: Arc<dyn AccountStore>) -> Result<Self> {
        let auth_service = AuthService::from_settings(&config, store)?;
        Ok(Self::with_service(config, auth_service))
    }

    pub fn with_service(config: Settings, auth_service: AuthService) -> Self {
        Self {
            config: Arc::new(config),
            auth_service: Arc::new(auth_service),
        }
    }
}

/// Registers every route on an `App`.
pub fn configure_app(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .configure(auth::handlers::configure);
}

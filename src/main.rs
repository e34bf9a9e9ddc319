use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use identity_server::config::CorsConfig;
use identity_server::{configure_app, AppState, Settings};
use std::net::TcpListener;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn build_cors(config: &CorsConfig) -> Cors {
    if !config.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        config
            .allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "DELETE"])
            .allowed_headers(vec!["Authorization", "Content-Type", "X-Bridge-Key"])
    };

    cors.max_age(config.max_age as usize)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded for environment {}", config.environment);
    if config.auth.bridge_key.is_none() {
        warn!("No bridge key configured, identity linking is disabled");
    }

    // Initialize application state
    let state = AppState::new(config.clone())
        .await
        .context("failed to initialize application state")?;
    let state = web::Data::new(state);

    // Drop idle rate-limit windows
    let limiter = state.auth_service.rate_limiter();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LIMITER_SWEEP_INTERVAL).await;
            limiter.cleanup().await;
        }
    });

    // Create and bind TCP listener
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .with_context(|| format!("failed to bind {}", address))?;
    info!("Starting server at {}", address);

    let cors_config = config.cors.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(build_cors(&cors_config))
            .app_data(state.clone())
            .configure(configure_app)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .context("server terminated with an error")?;

    Ok(())
}

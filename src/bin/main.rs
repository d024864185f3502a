use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use quill::auth::TokenKeys;
use quill::config::{Config, DATABASE_FILE};
use quill::core::assets::AssetStore;
use quill::core::db::{SqliteStore, Store};
use quill::handlers;
use quill::state::AppState;

fn jwt_secret(config: &Config) -> std::io::Result<Vec<u8>> {
    match &config.jwt_secret {
        Some(secret) => Ok(secret.as_bytes().to_vec()),
        None if cfg!(debug_assertions) => {
            warn!("QUILL_JWT_SECRET not set, using a temporary secret (dev only)");
            Ok(uuid::Uuid::new_v4().as_bytes().to_vec())
        }
        None => Err(std::io::Error::other("QUILL_JWT_SECRET must be set")),
    }
}

fn build_state(config: &Config) -> std::io::Result<AppState> {
    let store: Arc<dyn Store> = match &config.data_dir {
        Some(dir) => {
            let path = dir.join(DATABASE_FILE);
            info!(path = %path.display(), "using sqlite document store");
            Arc::new(SqliteStore::open(&path).map_err(std::io::Error::other)?)
        }
        None => {
            warn!("QUILL_DATA_DIR empty, data is kept in memory only");
            Arc::new(SqliteStore::open_in_memory().map_err(std::io::Error::other)?)
        }
    };
    let assets = AssetStore::open(&config.uploads_dir).map_err(std::io::Error::other)?;
    let tokens = TokenKeys::new(&jwt_secret(config)?, config.token_expiration_hours);

    Ok(AppState::new(store, assets, tokens))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
    {
        eprintln!("tracing init failed: {e}");
    }

    let config = Config::load().map_err(std::io::Error::other)?;
    let state = web::Data::new(build_state(&config)?);

    info!("Server listening on http://{}", config.bind);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(&config.bind)?
    .run()
    .await
}

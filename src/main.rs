use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustiscorm_lms::{
    config::Config,
    db,
    progress::{LogProgress, ProgressSink, WebhookProgress},
    repo::{MemoryRepository, PgRepository, Repository},
    routes::{self, AppState},
    storage::FsStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "rustiscorm_lms=info,axum=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let repo: Arc<dyn Repository> = match &config.database_url {
        Some(url) => Arc::new(PgRepository::new(db::connect(url).await?)),
        None => {
            tracing::warn!("DATABASE_URL not set, attempts are kept in memory only");
            Arc::new(MemoryRepository::new())
        }
    };
    let store = Arc::new(FsStore::new(&config.data_dir).await?);
    let progress: Arc<dyn ProgressSink> = match &config.progress_webhook_url {
        Some(url) => Arc::new(WebhookProgress::new(url.as_str())?),
        None => Arc::new(LogProgress),
    };

    let state = AppState::new(&config, repo, store, progress)
        .map_err(|e| anyhow::anyhow!("invalid launch signing key: {e}"))?;
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = TcpListener::bind(config.bind_address).await?;
    tracing::info!("listening on http://{}", config.bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use tracing::info;

use agora_api::AppStateInner;
use agora_db::Database;
use agora_gateway::ChannelRegistry;
use agora_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;

    // Shared state
    let state = Arc::new(AppStateInner {
        db: Arc::new(db),
        jwt_secret: config.jwt_secret.clone(),
        registry: ChannelRegistry::new(),
    });

    let app = agora_server::router(state);

    let addr = config.bind_addr()?;
    info!("Agora server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use axum::Router;
use tracing_subscriber::EnvFilter;

use socialmcp::{db, mcp, sweep, AppResult, AppState, Config};

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("socialmcp=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    let db_pool = db::connect(&config.database_url).await?;
    let bind_addr = config.bind_addr.clone();

    let app_state = AppState::new(db_pool, config)?;
    tokio::spawn(sweep::run(app_state.clone()));

    let app = Router::new()
        .merge(mcp::router())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await
        .map_err(anyhow::Error::from)?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await
        .map_err(anyhow::Error::from)?;
    Ok(())
}

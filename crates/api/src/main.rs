use std::time::Duration;

use anyhow::{Context, Result};
use trustroute_api::{build_router, build_state, spawn_housekeeping, ApiConfig};
use trustroute_observability::init_tracing;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("trustroute_api");

    let config = ApiConfig::from_env();
    let bind = config.bind.clone();

    let state = build_state(config).await?;
    spawn_housekeeping(state.clone(), HOUSEKEEPING_INTERVAL);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(bind = %bind, "trustroute api started");

    axum::serve(listener, app).await?;
    Ok(())
}

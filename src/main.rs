//! Operations entrypoint: populates the content cache for the known services
//! and rebuilds both recommendation models.

use reelfeed::{init_tracing, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let state = AppState::new(config)?;

    let services = state.known_service_ids().await;
    let refreshed = state.content_cache.refresh_for_services(&services).await;
    tracing::info!(refreshed, "Content refresh finished");

    match state.content_based.build_model().await {
        Ok(built) => tracing::info!(built, "Content similarity model pass finished"),
        Err(e) => tracing::error!(error = %e, "Content similarity model build failed"),
    }

    match state.collaborative.build_model().await {
        Ok(built) => tracing::info!(built, "Collaborative model pass finished"),
        Err(e) => tracing::error!(error = %e, "Collaborative model build failed"),
    }

    Ok(())
}

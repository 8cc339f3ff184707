//! Hearth Gateway: HTTP front for the moderated family messaging core.
//! Binds 127.0.0.1 on the configured port (default 8010).

mod routes;

use hearth_core::{Hearth, HearthConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env first so the classifier key and HEARTH_* overrides are visible to config.
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[hearth-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = HearthConfig::load()?;
    let hearth = Hearth::from_config(&cfg)?;
    tracing::info!(
        app = %cfg.app_name,
        store = ?cfg.store_backend,
        moderation_enabled = cfg.moderation.enabled,
        failure_policy = ?cfg.moderation.failure_policy,
        model = %cfg.moderation.model,
        "hearth core ready"
    );

    let _maintenance = hearth.spawn_maintenance(cfg.moderation.rate_limit_window());
    let app = routes::build_router(hearth);
    let addr = format!("127.0.0.1:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "hearth gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}

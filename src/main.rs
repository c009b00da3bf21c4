//! Lifeline - emergency alert dispatch and response coordination.
//!
//! # API Endpoints
//!
//! - `POST /alerts` - Raise an alert and notify nearby responders
//! - `POST /alerts/:id/responses` - Accept or decline an alert
//! - `POST /alerts/:id/cancel` - Requester cancels an alert
//! - `POST /alerts/:id/status` - Move an alert along its lifecycle
//! - `PUT /responders/:id/availability` - Publish responder availability
//! - `GET /subscribe/:topic` - WebSocket event stream
//! - `GET /health` - Health check

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lifeline::api::{AppState, router};
use lifeline::config::DispatchConfig;
use lifeline::dispatch::DispatchCoordinator;
use lifeline::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatchConfig::load();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("lifeline=info".parse()?))
        .init();

    info!(
        port = config.port,
        db_url = %config.database_url,
        expiry_secs = config.expiry_deadline.as_secs(),
        max_radius_m = config.max_radius_m,
        "Starting Lifeline server"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let coordinator = DispatchCoordinator::start(storage, &config).await?;
    let app = router(AppState { coordinator })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Lifeline is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use care_booking::booking::{BookingRouteState, SessionRegistry, booking_routes, spawn_expiry_task};
use care_booking::config::{DirectoryConfig, ServiceConfig};
use care_booking::directory::{BookingDirectory, LibSqlDirectory, RestDirectory, RestDirectoryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    eprintln!("🩺 Care Booking v{}", env!("CARGO_PKG_VERSION"));

    // ── Directory ───────────────────────────────────────────────────────
    let directory: Arc<dyn BookingDirectory> = match &config.directory {
        DirectoryConfig::Rest {
            base_url,
            api_key,
            timeout,
        } => {
            eprintln!("   Directory: {base_url}");
            Arc::new(RestDirectory::new(RestDirectoryConfig {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                timeout: *timeout,
            })?)
        }
        DirectoryConfig::Local { db_path, seed_demo } => {
            eprintln!("   Database: {}", db_path.display());
            let local = LibSqlDirectory::new_local(db_path).await?;
            if *seed_demo {
                local.seed_demo_data().await?;
            }
            Arc::new(local)
        }
    };

    // ── Sessions ────────────────────────────────────────────────────────
    let registry = SessionRegistry::new(directory, config.flow.clone(), config.session.clone());
    let _expiry_handle = spawn_expiry_task(Arc::clone(&registry));

    let app = booking_routes(BookingRouteState { registry }).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    eprintln!("   API: http://{}/api/booking/sessions\n", config.bind_addr);
    tracing::info!(addr = %config.bind_addr, "Booking API listening");

    axum::serve(listener, app).await?;
    Ok(())
}

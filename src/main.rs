// Server entry point: configuration, routing, background sweeper,
// graceful shutdown.
use axum::Router;
use clawlink_server::config::Config;
use clawlink_server::shutdown::shutdown_signal;
use clawlink_server::{build_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env();
    config.log_summary();
    let state = Arc::new(AppState::new(config.clone())?);

    let sweeper = state.sweeper.clone().spawn();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app: Router = build_router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("clawlink server listening on http://{addr}");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("server exited with error: {err}");
    }
    sweeper.abort();

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

mod config;
mod handlers;
mod rate_limit;
mod registry;
mod room;
mod store;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get, post};
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::{
    create_room, health_check, metrics_handler, room_page, room_status, AppState,
};
use crate::rate_limit::FixedWindowRateLimiter;
use crate::registry::RoomRegistry;
use crate::store::RoomStore;
use crate::websocket::websocket_handler;

#[derive(Parser, Debug)]
#[command(name = "skiff-pier")]
#[command(about = "Rendezvous and signalling server for skiff rooms")]
struct Cli {
    /// Override the listen port from the environment
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!("starting skiff-pier on port {}", config.port);
    match &config.redis_url {
        Some(url) => info!("room config store: redis at {url}"),
        None => info!("room config store: in-process only"),
    }

    let prometheus_handle = install_metrics_recorder();

    let store = match RoomStore::connect(config.redis_url.as_deref(), config.room_ttl_seconds).await
    {
        Ok(store) => store,
        Err(err) => {
            error!("failed to connect room store: {err}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        registry: RoomRegistry::new(store.clone()),
        store,
        limiter: Arc::new(FixedWindowRateLimiter::new(
            config.room_rate_limit,
            Duration::from_secs(config.room_rate_window_secs),
            10_000,
        )),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/:room_id", get(room_status))
        .route("/r/:room_id", get(room_page))
        .route("/ws/:room_id", any(websocket_handler))
        .with_state(state)
        .merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(prometheus_handle),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    info!("skiff-pier listening on {addr}");

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .await
        .expect("server terminated");
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

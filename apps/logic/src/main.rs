use std::sync::Arc;

use relay_common::RedisBus;
use relay_logic::config::Config;
use relay_logic::conn::Logic;
use relay_logic::store::RedisStore;
use relay_logic::{http, rpc, AppState};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!(topic = %config.bus_topic, "logic configured");

    let store = RedisStore::connect(&config.redis_url)
        .await
        .expect("mapping store connect failed");
    let bus = RedisBus::connect(&config.bus_url, &config.bus_topic)
        .await
        .expect("bus connect failed");

    let state = AppState {
        logic: Arc::new(Logic::new(
            config.clone(),
            Arc::new(store),
            Arc::new(bus),
        )),
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Producer HTTP surface.
    let http_app = http::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    let http_listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .expect("failed to bind http");
    tracing::info!(addr = %config.http_bind, "http listening");
    tokio::spawn(async move {
        axum::serve(http_listener, http_app)
            .await
            .expect("http server error");
    });

    // Comet-facing RPC surface.
    let rpc_app = rpc::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    let rpc_listener = tokio::net::TcpListener::bind(&config.rpc_bind)
        .await
        .expect("failed to bind rpc");
    tracing::info!(addr = %config.rpc_bind, "rpc listening");
    tokio::spawn(async move {
        axum::serve(rpc_listener, rpc_app)
            .await
            .expect("rpc server error");
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutting down");
}

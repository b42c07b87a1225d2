use std::net::SocketAddr;
use std::sync::Arc;

use relay_comet::config::Config;
use relay_comet::logic::LogicClient;
use relay_comet::server::Server;
use relay_comet::{rpc, tcp, ws};
use relay_common::{RedisRegistry, Registry};
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
    tracing::info!(
        server_id = %config.server_id,
        buckets = config.bucket_count,
        "comet configured"
    );

    let logic = LogicClient::new(&config.logic_rpc_url, config.logic_rpc_timeout);
    let server = Server::new(config.clone(), logic);

    // Register in discovery and keep the lease fresh.
    let registry = RedisRegistry::connect(
        &config.discovery_url,
        &config.comet_app_id,
        config.discovery_refresh,
    )
    .await
    .expect("discovery connect failed");
    registry
        .register(&config.server_id, &config.rpc_advertise_url)
        .await
        .expect("discovery register failed");
    {
        let registry = registry.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.discovery_refresh);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = registry
                    .register(&config.server_id, &config.rpc_advertise_url)
                    .await
                {
                    tracing::warn!(error = %e, "discovery refresh failed");
                }
            }
        });
    }

    // Framed TCP frontend.
    let tcp_listener = tokio::net::TcpListener::bind(&config.tcp_bind)
        .await
        .expect("failed to bind tcp");
    tracing::info!(addr = %config.tcp_bind, "tcp listening");
    tokio::spawn(tcp::serve(server.clone(), tcp_listener));

    // WebSocket frontend.
    let ws_app = ws::router(server.clone());
    let ws_listener = tokio::net::TcpListener::bind(&config.ws_bind)
        .await
        .expect("failed to bind ws");
    tracing::info!(addr = %config.ws_bind, "ws listening");
    tokio::spawn(async move {
        axum::serve(
            ws_listener,
            ws_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("ws server error");
    });

    // Job-facing RPC surface.
    let rpc_app = rpc::router(server.clone());
    let rpc_listener = tokio::net::TcpListener::bind(&config.rpc_bind)
        .await
        .expect("failed to bind rpc");
    tracing::info!(addr = %config.rpc_bind, "rpc listening");
    tokio::spawn(async move {
        axum::serve(rpc_listener, rpc_app)
            .await
            .expect("rpc server error");
    });

    // Periodic room-count report to Logic.
    tokio::spawn(server.clone().renew_online_loop());

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!(server_id = %config.server_id, "shutting down");
    if let Err(e) = registry.deregister(&config.server_id).await {
        tracing::warn!(error = %e, "discovery deregister failed");
    }
}

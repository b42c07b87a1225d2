use std::sync::Arc;

use relay_common::{RedisBusConsumer, RedisRegistry, Registry};
use relay_job::config::Config;
use relay_job::job::Job;
use relay_job::{consumer, discovery};
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
        topic = %config.bus_topic,
        group = %config.bus_group,
        "job configured"
    );

    let registry: Arc<dyn Registry> = Arc::new(
        RedisRegistry::connect(
            &config.discovery_url,
            &config.comet_app_id,
            config.discovery_refresh,
        )
        .await
        .expect("discovery connect failed"),
    );
    let bus_consumer = RedisBusConsumer::connect(
        &config.bus_url,
        &config.bus_topic,
        &config.bus_group,
        &config.consumer_name(),
    )
    .await
    .expect("bus connect failed");

    let job = Job::new(config.clone());

    discovery::init(&job, registry.as_ref())
        .await
        .expect("discovery snapshot timed out");
    tokio::spawn(discovery::watch(job.clone(), registry));

    tokio::spawn(consumer::consume(job.clone(), bus_consumer));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutting down");
}

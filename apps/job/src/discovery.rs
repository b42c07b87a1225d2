//! Discovery watch: seed the gateway table from a first snapshot (fatal if
//! one never arrives), then poll for membership changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_common::{Instance, Registry};
use tokio::time::timeout;

use crate::job::Job;

/// How long to wait for the first non-empty membership snapshot.
const INIT_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
#[error("no comet membership snapshot within {INIT_DEADLINE:?}")]
pub struct InitTimeout;

/// Block for the initial snapshot and seed the table from it.
pub async fn init(job: &Arc<Job>, registry: &dyn Registry) -> Result<(), InitTimeout> {
    let snapshot = timeout(INIT_DEADLINE, first_snapshot(registry))
        .await
        .map_err(|_| InitTimeout)?;
    job.reconcile(&snapshot);
    tracing::info!(comets = snapshot.len(), "discovery initialized");
    Ok(())
}

async fn first_snapshot(registry: &dyn Registry) -> HashMap<String, Instance> {
    loop {
        match registry.fetch().await {
            Ok(instances) if !instances.is_empty() => return instances,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "discovery fetch failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Poll the registry forever, reconciling the gateway table on every cycle.
pub async fn watch(job: Arc<Job>, registry: Arc<dyn Registry>) {
    let mut tick = tokio::time::interval(job.config.discovery_watch);
    tick.tick().await;
    loop {
        tick.tick().await;
        match registry.fetch().await {
            Ok(instances) => {
                if instances.is_empty() {
                    tracing::warn!("discovery returned no comets, keeping current table");
                    continue;
                }
                job.reconcile(&instances);
            }
            Err(e) => {
                tracing::warn!(error = %e, "discovery fetch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use relay_common::MemoryRegistry;

    fn job() -> Arc<Job> {
        Job::new(Arc::new(Config {
            discovery_url: String::new(),
            comet_app_id: "comet".into(),
            discovery_watch: Duration::from_millis(20),
            discovery_refresh: Duration::from_secs(10),
            bus_url: String::new(),
            bus_topic: "test".into(),
            bus_group: "test".into(),
            comet_rpc_timeout: Duration::from_millis(100),
            room_batch: 20,
            room_signal: Duration::from_millis(50),
        }))
    }

    #[tokio::test]
    async fn init_seeds_table_from_snapshot() {
        let job = job();
        let registry = MemoryRegistry::new();
        registry
            .register("comet-1", "http://10.0.0.1:3109")
            .await
            .unwrap();

        init(&job, &registry).await.unwrap();
        assert_eq!(job.servers(), vec!["comet-1".to_string()]);
    }

    #[tokio::test]
    async fn watch_picks_up_membership_changes() {
        let job = job();
        let registry = Arc::new(MemoryRegistry::new());
        registry.register("comet-1", "http://a").await.unwrap();
        init(&job, registry.as_ref()).await.unwrap();

        tokio::spawn(watch(job.clone(), registry.clone()));

        registry.register("comet-2", "http://b").await.unwrap();
        registry.deregister("comet-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.servers(), vec!["comet-2".to_string()]);
    }
}

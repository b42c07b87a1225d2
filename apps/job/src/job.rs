//! The push worker's shared state: the discovery-maintained gateway table and
//! the per-room aggregation workers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use relay_common::Instance;
use tokio::sync::mpsc;

use crate::comet::CometClient;
use crate::config::Config;
use crate::room::RoomMsg;

pub struct Job {
    pub config: Arc<Config>,
    comets: DashMap<String, Arc<CometClient>>,
    pub(crate) rooms: DashMap<String, mpsc::Sender<RoomMsg>>,
}

impl Job {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            comets: DashMap::new(),
            rooms: DashMap::new(),
        })
    }

    /// Bring the gateway table in line with a discovery snapshot: new
    /// hostnames get a client, missing ones are cancelled, the rest are
    /// reused.
    pub fn reconcile(&self, instances: &HashMap<String, Instance>) {
        for (hostname, ins) in instances {
            if !self.comets.contains_key(hostname) {
                self.comets.insert(
                    hostname.clone(),
                    Arc::new(CometClient::new(
                        hostname,
                        &ins.addr,
                        self.config.comet_rpc_timeout,
                    )),
                );
                tracing::info!(%hostname, addr = %ins.addr, "comet added");
            }
        }
        self.comets.retain(|hostname, client| {
            if instances.contains_key(hostname) {
                true
            } else {
                client.cancel();
                tracing::info!(%hostname, "comet removed");
                false
            }
        });
    }

    pub fn comet(&self, server: &str) -> Option<Arc<CometClient>> {
        self.comets.get(server).map(|entry| entry.value().clone())
    }

    /// Snapshot of every live gateway client.
    pub fn comets(&self) -> Vec<Arc<CometClient>> {
        self.comets.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Hostnames currently in the table; these are the PUSH partitions the
    /// consumer follows.
    pub fn servers(&self) -> Vec<String> {
        self.comets.iter().map(|entry| entry.key().clone()).collect()
    }
}

//! Bus consumption: follow the PUSH partition of every live gateway plus the
//! `room` and `broadcast` partitions, dispatch each work item, acknowledge
//! after dispatch (at-least-once).

use std::sync::Arc;

use prost::Message;
use relay_common::BusConsumer;
use relay_protocol::push::{PushMsg, PARTITION_BROADCAST, PARTITION_ROOM};

use crate::job::Job;

const POLL_BATCH: usize = 32;

pub async fn consume<C: BusConsumer>(job: Arc<Job>, mut consumer: C) {
    loop {
        // The partition set follows discovery: one stream per live gateway.
        let mut partitions = job.servers();
        partitions.push(PARTITION_ROOM.to_string());
        partitions.push(PARTITION_BROADCAST.to_string());

        let deliveries = match consumer.poll(&partitions, POLL_BATCH).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::error!(error = %e, "bus poll failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        for delivery in deliveries {
            match PushMsg::decode(delivery.payload.as_slice()) {
                Ok(msg) => {
                    tracing::debug!(
                        partition = %delivery.partition,
                        id = %delivery.id,
                        msg_type = msg.r#type,
                        "consumed push"
                    );
                    job.dispatch(msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        partition = %delivery.partition,
                        id = %delivery.id,
                        error = %e,
                        "undecodable work item"
                    );
                }
            }
            // Ack after dispatch: retries already happened, drops are final.
            if let Err(e) = consumer.ack(&delivery).await {
                tracing::warn!(id = %delivery.id, error = %e, "ack failed");
            }
        }
    }
}

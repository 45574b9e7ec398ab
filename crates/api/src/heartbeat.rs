use std::time::Duration;

use edgehub_codec::{Operation, RequestEnvelope};
use edgehub_core::{Kind, ObjectKey};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::client::EdgeClient;

impl EdgeClient {
    /// Report this node online once. Not acknowledged.
    pub async fn report_online(&self) -> Result<(), edgehub_bus::TransportError> {
        let req = RequestEnvelope::new(Kind::Node, Operation::Online, &ObjectKey::cluster(self.node_name()), self.node_name(), false);
        self.router.publish(&req, self.cfg.publish_timeout).await
    }
}

/// Shortest heartbeat period; `interval` refuses a zero period.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Report online now and then every `every`. A failed report waits for the next tick.
pub fn spawn_heartbeat(client: EdgeClient, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every.max(MIN_HEARTBEAT));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match client.report_online().await {
                Ok(()) => {
                    counter!("heartbeat_sent_total", 1u64);
                    debug!(node = %client.node_name(), "online reported");
                }
                Err(e) => {
                    counter!("heartbeat_failures_total", 1u64);
                    warn!(node = %client.node_name(), error = %e, "online report failed");
                }
            }
        }
    })
}

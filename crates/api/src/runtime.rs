//! Bring-up of a whole gateway from an `EdgeConfig` and a connected transport.

use std::sync::Arc;

use edgehub_bus::{Router, Transport};
use edgehub_core::Kind;
use edgehub_correlate::CorrelationCache;
use edgehub_persist::Layout;
use edgehub_store::start_index;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::{EdgeClient, Mirror};
use crate::config::EdgeConfig;
use crate::error::StartError;
use crate::heartbeat::spawn_heartbeat;
use crate::reconcile::spawn_reconnect_handshake;

/// Kinds the cloud side pushes to this node and that are mirrored on disk.
pub const MIRRORED_KINDS: [Kind; 5] = [Kind::Node, Kind::Pod, Kind::Lease, Kind::Secret, Kind::ConfigMap];

/// A running gateway: mirrors, subscriptions, sweeper, heartbeat and reconnect handshake.
pub struct EdgeHub {
    client: EdgeClient,
    tasks: Vec<JoinHandle<()>>,
}

impl EdgeHub {
    /// Open the mirrors, subscribe, start background tasks and run the start handshake,
    /// then again after every reconnect. A failed handshake is logged; the gateway keeps
    /// serving from local state.
    pub async fn start(cfg: EdgeConfig, transport: Arc<dyn Transport>) -> Result<Self, StartError> {
        let layout = Layout::new(&cfg.manifest_root);
        let link = transport.connected();
        let cache = Arc::new(CorrelationCache::new());
        let mut tasks = vec![cache.start(cfg.sweep.clone())];

        let mut router = Router::new(transport, cfg.topics(), cfg.compression, cache);
        let mut stores = Vec::with_capacity(MIRRORED_KINDS.len());
        for kind in MIRRORED_KINDS {
            let store = layout.open(kind)?;
            router = router.with_push_store(store.clone());
            stores.push(store);
        }
        let router = Arc::new(router);
        router.subscribe_all().await?;

        let mut client = EdgeClient::new(Arc::clone(&router), cfg.client);
        for store in stores {
            let index = start_index(store.clone(), cfg.watcher.clone());
            client = client.with_mirror(Mirror::new(store, Some(index)));
        }
        info!(node = %cfg.node_name, root = %layout.root().display(), "gateway started");

        if let Err(e) = client.reconcile(cfg.start_attempts).await {
            warn!(error = %e, "start handshake gave up; serving local state");
        }
        tasks.push(spawn_reconnect_handshake(client.clone(), link, cfg.start_attempts));
        tasks.push(spawn_heartbeat(client.clone(), cfg.heartbeat));
        Ok(Self { client, tasks })
    }

    pub fn client(&self) -> &EdgeClient {
        &self.client
    }

    /// Wait until every mirror has applied its first listing.
    pub async fn wait_synced(&self) {
        for kind in MIRRORED_KINDS {
            if let Some(index) = self.client.mirror(kind).and_then(|m| m.index.as_ref()) {
                index.wait_synced().await;
            }
        }
    }

    /// Stop the sweeper, heartbeat and reconnect handshake. Mirrors run for the life of the process.
    pub fn shutdown(self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

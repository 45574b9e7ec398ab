//! Start handshake: pull the authoritative pod and secret set and prune what the cloud no longer has.

use std::collections::BTreeSet;

use edgehub_codec::{Operation, RequestEnvelope};
use edgehub_core::{Kind, ManagedObject, ObjectKey};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::EdgeClient;
use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub attempts: u32,
    pub pods_saved: usize,
    pub secrets_saved: usize,
    pub pods_pruned: usize,
}

impl EdgeClient {
    /// Run the start handshake, retrying up to `attempts` times. Returns the last failure
    /// when every attempt fails. Call again after each reconnect.
    pub async fn reconcile(&self, attempts: u32) -> ClientResult<ReconcileReport> {
        let node = ObjectKey::cluster(self.node_name());
        let mut last = ClientError::Internal("no start attempt made".into());
        for attempt in 1..=attempts.max(1) {
            let req = RequestEnvelope::new(Kind::Node, Operation::Start, &node, self.node_name(), true);
            match self.round_trip(req, None).await {
                Ok(payload) => {
                    let items = payload.map(edgehub_core::Payload::into_items).unwrap_or_default();
                    let mut report = self.apply_start(items)?;
                    report.attempts = attempt;
                    counter!("reconcile_pruned_total", report.pods_pruned as u64);
                    info!(
                        attempt,
                        pods = report.pods_saved,
                        secrets = report.secrets_saved,
                        pruned = report.pods_pruned,
                        "start handshake done"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "start handshake failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn apply_start(&self, items: Vec<ManagedObject>) -> ClientResult<ReconcileReport> {
        let pods = self.mirror(Kind::Pod).ok_or_else(|| ClientError::Internal("no pod store".into()))?;
        let secrets = self.mirror(Kind::Secret);
        let mut report = ReconcileReport::default();
        let mut authoritative: BTreeSet<ObjectKey> = BTreeSet::new();
        for obj in items {
            let key = obj.key();
            let store = match obj.kind() {
                Kind::Pod => {
                    authoritative.insert(key.clone());
                    &pods.store
                }
                Kind::Secret => match secrets {
                    Some(m) => &m.store,
                    None => continue,
                },
                other => {
                    warn!(kind = %other, key = %key, "unexpected object in start payload");
                    continue;
                }
            };
            match store.put(&obj) {
                Ok(_) if obj.kind() == Kind::Pod => report.pods_saved += 1,
                Ok(_) => report.secrets_saved += 1,
                Err(e) => warn!(kind = %obj.kind(), key = %key, error = %e, "saving start object"),
            }
        }
        for key in pods.store.keys()? {
            if authoritative.contains(&key) {
                continue;
            }
            match pods.store.delete(&key) {
                Ok(_) => {
                    info!(key = %key, "pod gone from the cloud side, local copy removed");
                    report.pods_pruned += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "removing stale pod"),
            }
        }
        Ok(report)
    }
}

/// Re-run the start handshake each time `link` reports the transport back online.
/// Stops when the transport drops its side of the channel.
pub fn spawn_reconnect_handshake(client: EdgeClient, mut link: watch::Receiver<bool>, attempts: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        while link.changed().await.is_ok() {
            // Notifications only fire on real flips, so `true` here means a reconnect.
            if !*link.borrow_and_update() {
                info!(node = %client.node_name(), "transport disconnected");
                continue;
            }
            counter!("reconnects_total", 1u64);
            info!(node = %client.node_name(), "transport reconnected; repeating start handshake");
            if let Err(e) = client.reconcile(attempts).await {
                warn!(error = %e, "start handshake after reconnect gave up; serving local state");
            }
        }
    })
}

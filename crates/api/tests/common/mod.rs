#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgehub_api::{ClientConfig, EdgeClient, Mirror};
use edgehub_bus::{LoopbackTransport, Router, Topics};
use edgehub_codec::{AckEnvelope, Compression, RequestEnvelope};
use edgehub_core::{Kind, ManagedObject};
use edgehub_correlate::CorrelationCache;
use edgehub_persist::Layout;
use edgehub_store::start_index;
use edgehub_watcher::WatcherConfig;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const NODE: &str = "edge-1";
pub const ACK_TOPIC: &str = "/lite/cloud/ack/edge-1";

pub struct Edge {
    pub dir: tempfile::TempDir,
    pub layout: Layout,
    pub transport: LoopbackTransport,
    pub client: EdgeClient,
}

/// Pod and secret mirrors seeded with `seed`; indexes run when `indexed`.
pub async fn edge(indexed: bool, seed: &[ManagedObject]) -> Edge {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    for obj in seed {
        layout.open(obj.kind()).unwrap().put(obj).unwrap();
    }
    let transport = LoopbackTransport::new();
    let cache = Arc::new(CorrelationCache::new());
    let router = Arc::new(Router::new(Arc::new(transport.clone()), Topics::with_defaults(NODE), Compression::None, cache));
    router.subscribe_all().await.unwrap();
    let mut client = EdgeClient::new(router, ClientConfig::default());
    for kind in [Kind::Pod, Kind::Secret] {
        let store = layout.open(kind).unwrap();
        let index = indexed.then(|| start_index(store.clone(), WatcherConfig::default()));
        if let Some(index) = &index {
            index.wait_synced().await;
        }
        client = client.with_mirror(Mirror::new(store, index));
    }
    Edge { dir, layout, transport, client }
}

/// Play the cloud side: every decoded request may produce one ack on the node's ack topic.
pub fn cloud(t: &LoopbackTransport, answer: impl Fn(&RequestEnvelope) -> Option<AckEnvelope> + Send + Sync + 'static) {
    t.respond_with(move |m| {
        let req = edgehub_codec::decode_request(&m.payload).unwrap();
        match answer(&req) {
            Some(ack) => vec![(ACK_TOPIC.to_string(), Bytes::from(edgehub_codec::encode(&ack).unwrap()))],
            None => Vec::new(),
        }
    });
}

pub fn requests(t: &LoopbackTransport) -> Vec<(String, RequestEnvelope)> {
    t.published().into_iter().map(|m| (m.topic, edgehub_codec::decode_request(&m.payload).unwrap())).collect()
}

pub fn pod(ns: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() },
        ..Default::default()
    }
}

pub fn secret(ns: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() },
        ..Default::default()
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

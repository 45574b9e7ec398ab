use std::sync::Arc;
use std::time::Duration;

use edgehub_bus::{DispatchError, Dispatched, LoopbackTransport, Router, RouterError, Topics};
use edgehub_codec::{AckEnvelope, Compression, Operation, RequestEnvelope};
use edgehub_core::{Kind, ManagedObject, ObjectKey};
use edgehub_correlate::CorrelationCache;
use edgehub_persist::{Layout, PutOutcome};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

struct Fixture {
    _dir: tempfile::TempDir,
    layout: Layout,
    transport: LoopbackTransport,
    router: Arc<Router>,
}

fn fixture(compression: Compression) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    let transport = LoopbackTransport::new();
    let cache = Arc::new(CorrelationCache::new());
    let router = Router::new(Arc::new(transport.clone()), Topics::with_defaults("edge-1"), compression, cache)
        .with_push_store(layout.open(Kind::Node).unwrap())
        .with_push_store(layout.open(Kind::Lease).unwrap());
    Fixture { _dir: dir, layout, transport, router: Arc::new(router) }
}

fn node(name: &str) -> ManagedObject {
    Node { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }.into()
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let f = fixture(Compression::None);
    f.router.subscribe_all().await.unwrap();
    let again = f.router.subscribe_all().await;
    assert!(matches!(again, Err(RouterError::Duplicate(t)) if t == "/lite/cloud/ack/edge-1"));
}

#[tokio::test]
async fn acks_land_in_the_cache() {
    let f = fixture(Compression::Gzip);
    f.router.subscribe_all().await.unwrap();
    let ack = AckEnvelope::ok("id-1", None);
    let payload = Compression::Gzip.compress(&edgehub_codec::encode(&ack).unwrap()).unwrap();
    assert_eq!(f.transport.inject("/lite/cloud/ack/edge-1", &payload), 1);
    let got = f.router.cache().pop_wait("id-1", Duration::from_millis(10)).await;
    assert_eq!(got, Some(ack));
}

#[tokio::test]
async fn pushes_are_persisted_and_tombstones_remove() {
    let f = fixture(Compression::None);
    f.router.subscribe_all().await.unwrap();
    let bytes = edgehub_codec::encode(&node("edge-1")).unwrap();
    f.transport.inject("/lite/cloud/nodes/edge-1", &bytes);
    let store = f.layout.open(Kind::Node).unwrap();
    assert_eq!(store.load(&ObjectKey::cluster("edge-1")).unwrap(), Some(node("edge-1")));

    let mut lease = Lease {
        metadata: ObjectMeta { namespace: Some("kube-node-lease".into()), name: Some("edge-1".into()), ..Default::default() },
        ..Default::default()
    };
    let d = f.router.dispatch("/lite/cloud/leases/edge-1", &edgehub_codec::encode(&lease).unwrap()).unwrap();
    assert!(matches!(d, Dispatched::Pushed { kind: Kind::Lease, outcome: PutOutcome::Written(_), .. }));

    lease.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    let d = f.router.dispatch("/lite/cloud/leases/edge-1", &edgehub_codec::encode(&lease).unwrap()).unwrap();
    assert!(matches!(d, Dispatched::Pushed { outcome: PutOutcome::Removed(_), .. }));
    assert!(f.layout.open(Kind::Lease).unwrap().list_all().unwrap().is_empty());
}

#[tokio::test]
async fn bad_messages_are_dropped_without_side_effects() {
    let f = fixture(Compression::None);
    f.router.subscribe_all().await.unwrap();
    assert!(matches!(f.router.dispatch("/lite/cloud/ack/edge-1", b"identity: [oops"), Err(DispatchError::Decode(_))));
    assert!(matches!(f.router.dispatch("/lite/cloud/pods/edge-1", b"{}"), Err(DispatchError::NoStore(Kind::Pod))));
    assert!(matches!(f.router.dispatch("/somewhere/else", b""), Err(DispatchError::Unrouted(_))));
    // A pushed object whose kind disagrees with the topic is not written.
    let lease_topic_node_body = edgehub_codec::encode(&node("edge-1")).unwrap();
    assert!(f.router.dispatch("/lite/cloud/leases/edge-1", &lease_topic_node_body).is_err());
    // The subscription path swallows the same errors.
    f.transport.inject("/lite/cloud/ack/edge-1", b"identity: [oops");
    assert!(f.router.cache().is_empty());
}

#[tokio::test]
async fn publish_uses_the_request_topic_and_compression() {
    let f = fixture(Compression::Gzip);
    let req = RequestEnvelope::with_object(Operation::Create, node("edge-1").downcast::<Node>().unwrap(), "edge-1", true);
    f.router.publish(&req, Duration::from_secs(1)).await.unwrap();
    let sent = f.transport.take_published();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "/lite/edge/nodes/edge-1/create");
    let plain = Compression::Gzip.decompress(&sent[0].payload).unwrap();
    assert_eq!(edgehub_codec::decode_request(&plain).unwrap(), req);
}

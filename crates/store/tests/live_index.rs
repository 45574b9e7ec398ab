#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgehub_core::{Delta, DeltaKind, Kind, ManagedObject, ObjectKey};
use edgehub_persist::Layout;
use edgehub_store::start_index;
use edgehub_watcher::WatcherConfig;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn node(name: &str) -> ManagedObject {
    Node { metadata: ObjectMeta { name: Some(name.into()), ..Default::default() }, ..Default::default() }.into()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_alone_converges_to_directory_contents() {
    let dir = tempfile::tempdir().unwrap();
    let store = Layout::new(dir.path()).open(Kind::Node).unwrap();
    for i in 0..5 {
        store.put(&node(&format!("n{i}"))).unwrap();
    }
    let cfg = WatcherConfig { watch: false, relist_interval: Some(Duration::from_millis(50)), ..Default::default() };
    let index = start_index(store.clone(), cfg);
    index.wait_synced().await;
    assert_eq!(index.current().len(), 5);

    store.delete(&ObjectKey::cluster("n0")).unwrap();
    store.put(&node("n9")).unwrap();
    eventually(|| {
        let snap = index.current();
        snap.len() == 5 && snap.get(&ObjectKey::cluster("n9")).is_some() && snap.get(&ObjectKey::cluster("n0")).is_none()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callbacks_follow_live_changes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Layout::new(dir.path()).open(Kind::Node).unwrap();
    let index = start_index(store.clone(), WatcherConfig { relist_interval: Some(Duration::from_millis(200)), ..Default::default() });
    let seen: Arc<Mutex<Vec<(DeltaKind, String)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    index.on_change(move |d: &Delta| sink.lock().unwrap().push((d.change, d.key.name.clone())));
    index.wait_synced().await;

    store.put(&node("edge-1")).unwrap();
    eventually(|| index.get_by_key(&ObjectKey::cluster("edge-1")).is_some()).await;
    store.delete(&ObjectKey::cluster("edge-1")).unwrap();
    eventually(|| index.get_by_key(&ObjectKey::cluster("edge-1")).is_none()).await;

    // Callbacks run right after the snapshot swap.
    eventually(|| seen.lock().unwrap().len() >= 2).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(DeltaKind::Applied, "edge-1".to_string()), (DeltaKind::Deleted, "edge-1".to_string())]);
    assert!(index.get::<Node>(&ObjectKey::cluster("edge-1")).is_none());
}

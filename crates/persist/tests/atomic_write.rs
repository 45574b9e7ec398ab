use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use edgehub_core::{Kind, ManagedObject, ObjectKey};
use edgehub_persist::Layout;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn pod_with(value: &str) -> ManagedObject {
    let labels: BTreeMap<String, String> = (0..200).map(|i| (format!("label-{i}"), value.to_string())).collect();
    Pod {
        metadata: ObjectMeta { namespace: Some("ns".into()), name: Some("x".into()), labels: Some(labels), ..Default::default() },
        ..Default::default()
    }
    .into()
}

#[test]
fn readers_never_see_partial_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Layout::new(dir.path()).open(Kind::Pod).unwrap();
    let old = pod_with("old");
    let new = pod_with("new-value-that-is-longer");
    store.put(&old).unwrap();
    let path = store.path_for(&ObjectKey::namespaced("ns", "x")).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let store = store.clone();
        let (old, new, stop) = (old.clone(), new.clone(), stop.clone());
        std::thread::spawn(move || {
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                store.put(if i % 2 == 0 { &new } else { &old }).unwrap();
                i += 1;
            }
        })
    };

    for _ in 0..300 {
        let (_, obj) = store.read(&path).expect("reader saw an incomplete file");
        assert!(obj == old || obj == new);
    }
    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();

    // Only the object file remains; temp files were renamed away.
    assert_eq!(store.list_all().unwrap(), vec![path.clone()]);
    let leftovers = std::fs::read_dir(store.dir()).unwrap().count();
    assert_eq!(leftovers, 1);
}

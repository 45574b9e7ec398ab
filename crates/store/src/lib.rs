//! Edgehub store: in-RAM keyed index over one object directory.
//!
//! Watch events are applied by [`IndexBuilder`]; the ingest loop publishes
//! frozen snapshots through an `ArcSwap` and bumps an epoch watch so readers
//! never block the writer.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use edgehub_core::{Delta, DeltaKind, Kind, KindObject, ManagedObject, ObjectKey};
use edgehub_persist::{decode_key, ObjectFileStore, StoreError};
use edgehub_watcher::{spawn_watcher, FileEventKind, WatchEvent, WatcherConfig};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Events applied per snapshot swap at most.
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedObject {
    pub object: ManagedObject,
    pub path: PathBuf,
    /// Modification time when the file was last read; lets a relist skip unchanged files.
    pub mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub epoch: u64,
    /// Set once the first full listing pass has been applied.
    pub synced: bool,
    pub items: FxHashMap<ObjectKey, Arc<IndexedObject>>,
}

impl IndexSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&ManagedObject> {
        self.items.get(key).map(|e| &e.object)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All objects ordered by key.
    pub fn objects(&self) -> Vec<(ObjectKey, ManagedObject)> {
        let mut out: Vec<_> = self.items.iter().map(|(k, e)| (k.clone(), e.object.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// Applies watch events to the keyed map. Last writer wins per key.
pub struct IndexBuilder {
    store: ObjectFileStore,
    epoch: u64,
    synced: bool,
    dirty: bool,
    items: FxHashMap<ObjectKey, Arc<IndexedObject>>,
}

impl IndexBuilder {
    pub fn new(store: ObjectFileStore) -> Self {
        Self { store, epoch: 0, synced: false, dirty: false, items: FxHashMap::default() }
    }

    pub fn kind(&self) -> Kind {
        self.store.kind()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ManagedObject> {
        self.items.get(key).map(|e| &e.object)
    }

    /// Apply one event and return the resulting index mutations.
    pub fn apply(&mut self, ev: WatchEvent) -> Vec<Delta> {
        match ev {
            WatchEvent::File(fe) if fe.kind.is_upsert() => self.upsert(fe.kind, &fe.path).into_iter().collect(),
            WatchEvent::File(fe) => self.remove_path(&fe.path).into_iter().collect(),
            WatchEvent::Listed { present } => self.sync(&present),
        }
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn freeze(&self) -> Arc<IndexSnapshot> {
        Arc::new(IndexSnapshot { epoch: self.epoch, synced: self.synced, items: self.items.clone() })
    }

    fn bump(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
        self.dirty = true;
    }

    fn file_key(&self, path: &Path) -> Option<ObjectKey> {
        let name = path.file_name().and_then(|n| n.to_str())?;
        match decode_key(self.kind(), name) {
            Ok(k) => Some(k),
            Err(e) => {
                counter!("index_rejected_total", 1u64);
                warn!(kind = %self.kind(), error = %e, "skipping file");
                None
            }
        }
    }

    fn upsert(&mut self, how: FileEventKind, path: &Path) -> Option<Delta> {
        let key = self.file_key(path)?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if how == FileEventKind::ListAdd {
            if let Some(cur) = self.items.get(&key) {
                if cur.mtime.is_some() && cur.mtime == mtime {
                    return None;
                }
            }
        }
        let object = match self.store.read(path) {
            Ok((_, obj)) => obj,
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = %self.kind(), key = %key, "file vanished before read");
                return None;
            }
            Err(e) => {
                counter!("index_rejected_total", 1u64);
                warn!(kind = %self.kind(), key = %key, error = %e, "object rejected");
                return None;
            }
        };
        let unchanged = self.items.get(&key).is_some_and(|cur| cur.object == object);
        self.items.insert(key.clone(), Arc::new(IndexedObject { object: object.clone(), path: path.to_path_buf(), mtime }));
        if unchanged {
            return None;
        }
        self.bump();
        counter!("index_mutations_total", 1u64);
        debug!(kind = %self.kind(), key = %key, event = ?how, "indexed");
        Some(Delta { kind: self.kind(), key, change: DeltaKind::Applied, object })
    }

    fn remove_key(&mut self, key: ObjectKey) -> Option<Delta> {
        let old = self.items.remove(&key)?;
        self.bump();
        counter!("index_mutations_total", 1u64);
        debug!(kind = %self.kind(), key = %key, "unindexed");
        Some(Delta { kind: self.kind(), key, change: DeltaKind::Deleted, object: old.object.clone() })
    }

    fn remove_path(&mut self, path: &Path) -> Option<Delta> {
        let key = self.file_key(path)?;
        self.remove_key(key)
    }

    /// Drop every key whose file was absent from a complete listing.
    fn sync(&mut self, present: &[PathBuf]) -> Vec<Delta> {
        let kind = self.kind();
        let keep: FxHashSet<ObjectKey> = present
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(|n| decode_key(kind, n).ok())
            .collect();
        let stale: Vec<ObjectKey> = self.items.keys().filter(|k| !keep.contains(*k)).cloned().collect();
        let out: Vec<Delta> = stale.into_iter().filter_map(|k| self.remove_key(k)).collect();
        if !self.synced {
            self.synced = true;
            self.bump();
        }
        out
    }
}

pub type ChangeCallback = Arc<dyn Fn(&Delta) + Send + Sync>;

/// Read side of a running index.
#[derive(Clone)]
pub struct IndexHandle {
    kind: Kind,
    snap: Arc<ArcSwap<IndexSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    callbacks: Arc<ArcSwap<Vec<ChangeCallback>>>,
}

impl IndexHandle {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.snap.load().get(key).cloned()
    }

    /// Typed lookup; `None` when absent.
    pub fn get<T: KindObject>(&self, key: &ObjectKey) -> Option<T> {
        self.get_by_key(key).and_then(ManagedObject::downcast)
    }

    pub fn list(&self) -> Vec<ManagedObject> {
        self.current().objects().into_iter().map(|(_, o)| o).collect()
    }

    /// Register `f` to run after every index mutation, in mutation order.
    pub fn on_change(&self, f: impl Fn(&Delta) + Send + Sync + 'static) {
        let f: ChangeCallback = Arc::new(f);
        self.callbacks.rcu(|cbs| {
            let mut next = Vec::with_capacity(cbs.len() + 1);
            next.extend(cbs.iter().cloned());
            next.push(f.clone());
            next
        });
    }

    /// Wait until the first full listing has been applied.
    pub async fn wait_synced(&self) {
        let mut rx = self.subscribe_epoch();
        while !self.snap.load().synced {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawn an ingest loop applying `rx`'s events to an index over `store`.
pub fn spawn_indexer(store: ObjectFileStore, mut rx: mpsc::Receiver<WatchEvent>) -> IndexHandle {
    let kind = store.kind();
    let snap = Arc::new(ArcSwap::from_pointee(IndexSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let callbacks: Arc<ArcSwap<Vec<ChangeCallback>>> = Arc::new(ArcSwap::from_pointee(Vec::new()));
    let snap_clone = Arc::clone(&snap);
    let callbacks_clone = Arc::clone(&callbacks);

    tokio::spawn(async move {
        let mut builder = IndexBuilder::new(store);
        while let Some(first) = rx.recv().await {
            let mut deltas = builder.apply(first);
            let mut applied = 1;
            while applied < MAX_BATCH {
                match rx.try_recv() {
                    Ok(ev) => {
                        deltas.extend(builder.apply(ev));
                        applied += 1;
                    }
                    Err(_) => break,
                }
            }
            if builder.take_dirty() {
                let next = builder.freeze();
                let epoch = next.epoch;
                snap_clone.store(next);
                let _ = epoch_tx.send(epoch);
            }
            if !deltas.is_empty() {
                let cbs = callbacks_clone.load();
                for d in &deltas {
                    for cb in cbs.iter() {
                        cb(d);
                    }
                }
            }
        }
        info!(kind = %kind, "index loop stopped");
    });

    IndexHandle { kind, snap, epoch_rx, callbacks }
}

/// Watch `store`'s directory and keep an index of it.
pub fn start_index(store: ObjectFileStore, cfg: WatcherConfig) -> IndexHandle {
    let (tx, rx) = mpsc::channel(MAX_BATCH);
    let _watcher = spawn_watcher(store.dir().to_path_buf(), cfg, tx);
    spawn_indexer(store, rx)
}

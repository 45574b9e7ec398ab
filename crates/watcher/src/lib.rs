//! Edgehub directory watcher: turns one per-kind object directory into a stream
//! of file events. Filesystem notifications drive the common case; a full
//! listing pass on start, after every watch (re)establishment and on a fixed
//! interval recovers anything the notifications dropped.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use edgehub_persist::{is_object_file, list_object_files};
use metrics::counter;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// Seen by a listing pass rather than a notification.
    ListAdd,
    Add,
    Modify,
    Delete,
}

impl FileEventKind {
    pub fn is_upsert(self) -> bool {
        !matches!(self, FileEventKind::Delete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    File(FileEvent),
    /// A listing pass finished; `present` holds every object file it saw.
    Listed { present: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Subscribe to filesystem notifications. When false only listing passes run.
    pub watch: bool,
    /// Full relist period; `None` disables periodic relisting.
    pub relist_interval: Option<Duration>,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            watch: true,
            relist_interval: Some(Duration::from_secs(15)),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("listing {}: {source}", dir.display())]
    List { dir: PathBuf, #[source] source: std::io::Error },
    #[error("watching {}: {source}", dir.display())]
    Notify { dir: PathBuf, #[source] source: notify::Error },
}

/// Smallest delay a [`Backoff`] hands out.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Exponential backoff between `min` and `max`, doubling per failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(MIN_BACKOFF);
        let max = max.max(min);
        Self { min, max, next: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Sorted object files in `dir`. A missing directory lists as empty.
pub fn list_pass(dir: &Path) -> Result<Vec<PathBuf>, WatchError> {
    match list_object_files(dir) {
        Ok(files) => Ok(files),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(WatchError::List { dir: dir.to_path_buf(), source }),
    }
}

fn relevant(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(is_object_file).unwrap_or(false)
}

/// Map one notification to file events.
///
/// Create and content writes are upserts, removals are deletes. A rename is a
/// delete of its source and an upsert of its target, so a temp-file-and-rename
/// write shows up as an upsert of the object file.
pub fn classify(event: &Event) -> Vec<FileEvent> {
    let fixed = match &event.kind {
        EventKind::Create(_) => Some(FileEventKind::Add),
        EventKind::Remove(_) => Some(FileEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FileEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FileEventKind::Add),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first().filter(|p| relevant(p)) {
                out.push(FileEvent { kind: FileEventKind::Delete, path: from.clone() });
            }
            if let Some(to) = event.paths.get(1).filter(|p| relevant(p)) {
                out.push(FileEvent { kind: FileEventKind::Add, path: to.clone() });
            }
            return out;
        }
        // Rename without a direction: whichever side still exists.
        EventKind::Modify(ModifyKind::Name(_)) => None,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => Some(FileEventKind::Modify),
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter(|p| relevant(p))
        .map(|p| {
            let kind = fixed.unwrap_or_else(|| if p.exists() { FileEventKind::Add } else { FileEventKind::Delete });
            FileEvent { kind, path: p.clone() }
        })
        .collect()
}

struct ActiveWatch {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
}

fn open_watch(dir: &Path) -> Result<ActiveWatch, WatchError> {
    let (tx, rx) = mpsc::channel(256);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.blocking_send(res);
    })
    .map_err(|source| WatchError::Notify { dir: dir.to_path_buf(), source })?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|source| WatchError::Notify { dir: dir.to_path_buf(), source })?;
    Ok(ActiveWatch { _watcher: watcher, rx })
}

async fn recv_watch(active: &mut Option<ActiveWatch>) -> Option<notify::Result<Event>> {
    match active {
        Some(w) => w.rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

/// Run one listing pass into `tx`. Returns false once the receiver is gone.
async fn send_listing(dir: &Path, tx: &mpsc::Sender<WatchEvent>) -> bool {
    let files = match list_pass(dir) {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "list pass failed");
            return !tx.is_closed();
        }
    };
    counter!("watcher_list_passes_total", 1u64);
    debug!(dir = %dir.display(), count = files.len(), "list pass");
    for path in &files {
        let ev = WatchEvent::File(FileEvent { kind: FileEventKind::ListAdd, path: path.clone() });
        if tx.send(ev).await.is_err() {
            return false;
        }
    }
    tx.send(WatchEvent::Listed { present: files }).await.is_ok()
}

/// Spawn [`run_watcher`] on the current runtime.
pub fn spawn_watcher(dir: PathBuf, cfg: WatcherConfig, tx: mpsc::Sender<WatchEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { run_watcher(dir, cfg, tx).await })
}

/// Watch `dir` until `tx`'s receiver is dropped. Watch failures never end the
/// loop; they are retried with backoff while listing passes keep running.
pub async fn run_watcher(dir: PathBuf, cfg: WatcherConfig, tx: mpsc::Sender<WatchEvent>) {
    info!(dir = %dir.display(), watch = cfg.watch, relist = ?cfg.relist_interval, "directory watcher started");
    let mut backoff = Backoff::new(cfg.backoff_min, cfg.backoff_max);
    let mut active: Option<ActiveWatch> = None;
    let mut retry_at = cfg.watch.then(Instant::now);
    let mut relist_at = cfg.relist_interval.map(|d| Instant::now() + d);
    let mut need_list = true;

    loop {
        if active.is_none() && retry_at.is_some_and(|t| t <= Instant::now()) {
            match open_watch(&dir) {
                Ok(w) => {
                    info!(dir = %dir.display(), "watch established");
                    active = Some(w);
                    retry_at = None;
                    backoff.reset();
                    need_list = true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    counter!("watcher_watch_failures_total", 1u64);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "watch unavailable");
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }
        if need_list {
            need_list = false;
            if !send_listing(&dir, &tx).await {
                break;
            }
        }

        let retry = if active.is_none() { retry_at } else { None };
        tokio::select! {
            _ = tx.closed() => break,
            _ = sleep_until_opt(relist_at) => {
                relist_at = cfg.relist_interval.map(|d| Instant::now() + d);
                need_list = true;
            }
            _ = sleep_until_opt(retry) => {}
            msg = recv_watch(&mut active) => match msg {
                Some(Ok(event)) => {
                    for fe in classify(&event) {
                        counter!("watcher_events_total", 1u64);
                        debug!(kind = ?fe.kind, path = %fe.path.display(), "file event");
                        if tx.send(WatchEvent::File(fe)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "watch error; re-establishing");
                    active = None;
                    retry_at = Some(Instant::now() + delay);
                }
                None => {
                    let delay = backoff.next_delay();
                    warn!(retry_in_ms = delay.as_millis() as u64, "watch channel closed; re-establishing");
                    active = None;
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }
    }
    info!(dir = %dir.display(), "directory watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn ev(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    fn kinds(events: Vec<FileEvent>) -> Vec<(FileEventKind, String)> {
        events.into_iter().map(|e| (e.kind, e.path.file_name().unwrap().to_string_lossy().into_owned())).collect()
    }

    #[test]
    fn classify_maps_event_kinds() {
        let got = kinds(classify(&ev(EventKind::Create(CreateKind::File), &["/d/ns#a.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Add, "ns#a.yaml".into())]);

        let got = kinds(classify(&ev(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/d/ns#a.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Modify, "ns#a.yaml".into())]);

        let got = kinds(classify(&ev(EventKind::Remove(RemoveKind::File), &["/d/ns#a.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Delete, "ns#a.yaml".into())]);

        let got = kinds(classify(&ev(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/d/ns#a.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Delete, "ns#a.yaml".into())]);

        assert!(classify(&ev(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)), &["/d/ns#a.yaml"])).is_empty());
    }

    #[test]
    fn atomic_rename_is_an_upsert() {
        let got = kinds(classify(&ev(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/d/.tmpXYZ.tmp", "/d/ns#a.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Add, "ns#a.yaml".into())]);
        let got = kinds(classify(&ev(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/d/ns#a.yaml", "/d/ns#b.yaml"])));
        assert_eq!(got, vec![(FileEventKind::Delete, "ns#a.yaml".into()), (FileEventKind::Add, "ns#b.yaml".into())]);
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let e = ev(EventKind::Create(CreateKind::File), &["/d/.hidden.yaml", "/d/readme.md", "/d/ns#a.yaml.swp"]);
        assert!(classify(&e).is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(20));
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 20, 20]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn zero_backoff_still_waits() {
        let mut b = Backoff::new(Duration::ZERO, Duration::ZERO);
        let delays: Vec<Duration> = (0..3).map(|_| b.next_delay()).collect();
        assert!(delays.iter().all(|d| *d >= MIN_BACKOFF));
        let mut b = Backoff::new(Duration::ZERO, Duration::from_millis(8));
        let delays: Vec<u128> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn missing_dir_lists_empty() {
        assert!(list_pass(Path::new("/nonexistent/edgehub/pods")).unwrap().is_empty());
    }
}

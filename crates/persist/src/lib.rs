//! Edgehub persistence: durable per-kind directories of YAML object files.
//! One file per object; writes land through a temp file and rename so readers
//! only ever see complete content.

#![forbid(unsafe_code)]

mod key;

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use edgehub_codec::CodecError;
use edgehub_core::{Kind, ManagedObject, ObjectKey};
use metrics::{counter, histogram};
use tracing::{debug, info};

pub use key::{decode_key, encode_key, is_object_file, KeyFormatError, FILE_SUFFIX, SEPARATOR};

/// Files larger than this are refused rather than decoded.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

pub const DEFAULT_MANIFEST_ROOT: &str = "/etc/kubernetes/mqttManifests";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Key(#[from] KeyFormatError),
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("{}: {source}", path.display())]
    Decode { path: PathBuf, #[source] source: CodecError },
    #[error("encode {key}: {source}")]
    Encode { key: String, #[source] source: CodecError },
    #[error("{}: file is {size} bytes, limit 10 MiB", path.display())]
    TooLarge { path: PathBuf, size: u64 },
    #[error("{}: object key {object_key} does not match file key {file_key}", path.display())]
    KeyMismatch { path: PathBuf, file_key: ObjectKey, object_key: ObjectKey },
    #[error("store for {expected} given a {found} object")]
    WrongKind { expected: Kind, found: Kind },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// Per-kind directory layout under one manifest root: `<root>/<kind-plural>/`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.plural())
    }

    /// Open (and create if needed) the store for `kind`.
    pub fn open(&self, kind: Kind) -> Result<ObjectFileStore, StoreError> {
        ObjectFileStore::open(kind, self.dir(kind))
    }
}

/// What `put_or_tombstone` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Written(PathBuf),
    /// The object was terminating; its file was removed (or already absent).
    Removed(PathBuf),
}

/// Durable directory of objects of one kind.
#[derive(Debug, Clone)]
pub struct ObjectFileStore {
    kind: Kind,
    dir: PathBuf,
}

impl ObjectFileStore {
    pub fn open(kind: Kind, dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        debug!(kind = %kind, dir = %dir.display(), "object store opened");
        Ok(Self { kind, dir })
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &ObjectKey) -> Result<PathBuf, StoreError> {
        Ok(self.dir.join(encode_key(self.kind, key)?))
    }

    /// Write `obj` to its file, replacing any previous content atomically.
    pub fn put(&self, obj: &ManagedObject) -> Result<PathBuf, StoreError> {
        let started = std::time::Instant::now();
        if obj.kind() != self.kind {
            return Err(StoreError::WrongKind { expected: self.kind, found: obj.kind() });
        }
        let key = obj.key();
        let path = self.path_for(&key)?;
        let bytes = edgehub_codec::encode(obj).map_err(|source| StoreError::Encode { key: key.to_string(), source })?;

        // Hidden temp name so the watcher ignores it until the rename.
        let mut tmp = tempfile::Builder::new().prefix(".").suffix(".tmp").tempfile_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(&bytes).map_err(io_err(tmp.path()))?;
        tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
        tmp.persist(&path).map_err(|e| StoreError::Io { path: path.clone(), source: e.error })?;

        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(kind = %self.kind, key = %key, "object written");
        Ok(path)
    }

    /// Write `obj`, or remove its file when the object carries a deletion timestamp.
    pub fn put_or_tombstone(&self, obj: &ManagedObject) -> Result<PutOutcome, StoreError> {
        if obj.is_terminating() {
            let key = obj.key();
            self.delete(&key)?;
            return Ok(PutOutcome::Removed(self.path_for(&key)?));
        }
        self.put(obj).map(PutOutcome::Written)
    }

    /// Remove the file for `key`. Returns whether a file was present.
    pub fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                counter!("persist_delete_total", 1u64);
                info!(kind = %self.kind, key = %key, "object file removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    /// All object files currently present, sorted by file name.
    pub fn list_all(&self) -> Result<Vec<PathBuf>, StoreError> {
        list_object_files(&self.dir).map_err(io_err(&self.dir))
    }

    /// Keys of all present object files; files with malformed names are skipped.
    pub fn keys(&self) -> Result<Vec<ObjectKey>, StoreError> {
        Ok(self
            .list_all()?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(|n| decode_key(self.kind, n).ok()))
            .collect())
    }

    /// Decode the file at `path`, enforcing that its name and content agree on the key.
    pub fn read(&self, path: &Path) -> Result<(ObjectKey, ManagedObject), StoreError> {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let file_key = decode_key(self.kind, file_name)?;
        let bytes = read_bounded(path)?;
        let obj = edgehub_codec::decode_object(self.kind, &bytes).map_err(|source| StoreError::Decode { path: path.to_path_buf(), source })?;
        let object_key = obj.key();
        if object_key != file_key {
            return Err(StoreError::KeyMismatch { path: path.to_path_buf(), file_key, object_key });
        }
        Ok((file_key, obj))
    }

    /// Load the object for `key`, if its file exists.
    pub fn load(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, StoreError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        match self.read(&path) {
            Ok((_, obj)) => Ok(Some(obj)),
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Object files directly under `dir` (hidden files and foreign suffixes skipped), sorted.
pub fn list_object_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_object_file(name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn read_bounded(path: &Path) -> Result<Vec<u8>, StoreError> {
    let file = fs::File::open(path).map_err(io_err(path))?;
    let mut buf = Vec::new();
    file.take(MAX_FILE_BYTES + 1).read_to_end(&mut buf).map_err(io_err(path))?;
    if buf.len() as u64 > MAX_FILE_BYTES {
        return Err(StoreError::TooLarge { path: path.to_path_buf(), size: buf.len() as u64 });
    }
    Ok(buf)
}

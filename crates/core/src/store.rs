use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::run_log::sanitize_filename_component;
use crate::{Error, Result};

pub const ARCHIVE_UPLOAD_STATE_KEY: &str = "backup.archive_upload_state";
pub const RESTORE_STATE_KEY: &str = "backup.restore_state";
pub const FINISHED_INITIAL_BACKUP_KEY: &str = "backup.finished_initial_backup";
pub const UPLOAD_BANNER_VISIBLE_KEY: &str = "backup.upload_banner_visible";

/// Durable byte values under string keys.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

pub fn get_flag(store: &dyn KeyValueStore, key: &str) -> Result<bool> {
    Ok(get_json::<bool>(store, key)?.unwrap_or(false))
}

pub fn put_flag(store: &dyn KeyValueStore, key: &str, value: bool) -> Result<()> {
    put_json(store, key, &value)
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreWriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl Default for StoreWriteOptions {
    fn default() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

/// One file per key under `dir`, replaced atomically on every write.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    options: StoreWriteOptions,
}

impl FileKeyValueStore {
    pub fn open(dir: impl Into<PathBuf>, options: StoreWriteOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Store {
            message: format!("create {}: {e}", dir.display()),
        })?;
        Ok(Self { dir, options })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let name = sanitize_filename_component(key);
        if name.is_empty() || name.starts_with('.') {
            return Err(Error::Store {
                message: format!("invalid key: {key:?}"),
            });
        }
        Ok(self.dir.join(name))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store {
                message: format!("read {key}: {e}"),
            }),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        write_atomic(&path, value, self.options).map_err(|e| Error::Store {
            message: format!("write {key}: {e}"),
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store {
                message: format!("remove {key}: {e}"),
            }),
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn write_atomic(
    path: &Path,
    bytes: &[u8],
    options: StoreWriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{name}.tmp.{}.{seq}", std::process::id()));
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(bytes)?;
    if options.fsync_file {
        f.sync_all()?;
    }
    drop(f);

    std::fs::rename(&tmp, path)?;

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path(), StoreWriteOptions::default()).unwrap();
        assert_eq!(store.get(RESTORE_STATE_KEY).unwrap(), None);

        store.put(RESTORE_STATE_KEY, b"3").unwrap();
        put_flag(&store, FINISHED_INITIAL_BACKUP_KEY, true).unwrap();
        drop(store);

        let store = FileKeyValueStore::open(dir.path(), StoreWriteOptions::default()).unwrap();
        assert_eq!(store.get(RESTORE_STATE_KEY).unwrap(), Some(b"3".to_vec()));
        assert!(get_flag(&store, FINISHED_INITIAL_BACKUP_KEY).unwrap());

        store.remove(RESTORE_STATE_KEY).unwrap();
        store.remove(RESTORE_STATE_KEY).unwrap();
        assert_eq!(store.get(RESTORE_STATE_KEY).unwrap(), None);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn dot_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path(), StoreWriteOptions::default()).unwrap();
        assert!(matches!(store.put("..", b"x"), Err(Error::Store { .. })));
        assert!(matches!(store.get(""), Err(Error::Store { .. })));
    }

    #[test]
    fn json_helpers_over_memory_store() {
        let store = InMemoryKeyValueStore::new();
        assert!(!get_flag(&store, UPLOAD_BANNER_VISIBLE_KEY).unwrap());
        put_json(&store, "k", &vec![1u32, 2]).unwrap();
        assert_eq!(get_json::<Vec<u32>>(&store, "k").unwrap(), Some(vec![1, 2]));

        store.put("bad", b"{").unwrap();
        assert!(matches!(get_json::<bool>(&store, "bad"), Err(Error::Json(_))));
    }
}

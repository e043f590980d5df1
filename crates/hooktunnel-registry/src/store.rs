//! `tunnels.json` persistence
//!
//! Every mutation runs while holding an exclusive advisory lock on
//! `tunnels.lock`, and the file is replaced atomically, so concurrent CLI
//! invocations never interleave or observe a half-written registry.
//!
//! An unparsable registry is an error rather than an empty one: the next
//! save would otherwise drop every record and orphan the live proxies.

use crate::error::{RegistryError, Result};
use crate::paths::DataDir;
use crate::record::TunnelRecord;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub type Tunnels = BTreeMap<String, TunnelRecord>;

pub struct TunnelStore {
    tunnels_file: PathBuf,
    lock_file: PathBuf,
}

impl TunnelStore {
    pub fn new(paths: &DataDir) -> Self {
        Self {
            tunnels_file: paths.tunnels_file(),
            lock_file: paths.lock_file(),
        }
    }

    /// Unlocked snapshot, for read-only callers
    pub fn load(&self) -> Result<Tunnels> {
        read_tunnels(&self.tunnels_file)
    }

    /// Block until the registry lock is ours
    pub fn lock(&self) -> Result<StoreLock> {
        if let Some(parent) = self.lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)?;
        file.lock_exclusive().map_err(|source| RegistryError::Lock {
            path: self.lock_file.clone(),
            source,
        })?;
        debug!("Acquired registry lock {:?}", self.lock_file);

        Ok(StoreLock {
            file,
            tunnels_file: self.tunnels_file.clone(),
        })
    }
}

/// Exclusive access to the registry, released on drop
pub struct StoreLock {
    file: File,
    tunnels_file: PathBuf,
}

impl StoreLock {
    pub fn load(&self) -> Result<Tunnels> {
        read_tunnels(&self.tunnels_file)
    }

    pub fn save(&self, tunnels: &Tunnels) -> Result<()> {
        write_json_atomic(&self.tunnels_file, tunnels)
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release registry lock: {}", e);
        }
    }
}

fn read_tunnels(path: &Path) -> Result<Tunnels> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tunnels::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(Tunnels::new());
    }

    serde_json::from_str(&content).map_err(|source| RegistryError::CorruptRegistry {
        path: path.to_path_buf(),
        source,
    })
}

/// Missing files load as the default value; corrupt ones too, with a warning
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Ignoring unreadable {:?}: {}", path, e);
            Ok(T::default())
        }
    }
}

/// Write pretty JSON next to `path`, then rename it into place
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, TunnelStore) {
        let dir = TempDir::new().unwrap();
        let store = TunnelStore::new(&DataDir::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let (dir, store) = store();
        let path = dir.path().join("tunnels.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(store.load(), Err(RegistryError::CorruptRegistry { .. })));
        let lock = store.lock().unwrap();
        assert!(matches!(lock.load(), Err(RegistryError::CorruptRegistry { .. })));
        drop(lock);

        // Left untouched for the user to repair
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_one_bad_record_keeps_the_file() {
        let (dir, store) = store();
        let path = dir.path().join("tunnels.json");
        let mut good =
            serde_json::to_value(TunnelRecord::new("good", 3000, 8000, "good", "localhost"))
                .unwrap();
        let mut bad = good.clone();
        bad["name"] = "bad".into();
        bad["created_at"] = "not a time".into();
        good["pid"] = 4242.into();
        let content = serde_json::json!({ "good": good, "bad": bad }).to_string();
        fs::write(&path, &content).unwrap();

        match store.load() {
            Err(RegistryError::CorruptRegistry { path: reported, .. }) => {
                assert_eq!(reported, path)
            }
            other => panic!("expected corrupt registry, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_empty_file_is_empty() {
        let (dir, store) = store();
        fs::write(dir.path().join("tunnels.json"), "").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let (dir, store) = store();
        let mut tunnels = Tunnels::new();
        tunnels.insert(
            "api".to_string(),
            TunnelRecord::new("api", 3000, 8000, "api", "localhost"),
        );

        {
            let lock = store.lock().unwrap();
            lock.save(&tunnels).unwrap();
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded, tunnels);

        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n != "tunnels.json" && n != "tunnels.lock")
            .collect();
        assert!(entries.is_empty(), "stray files: {:?}", entries);
    }

    #[test]
    fn test_lock_serializes_writers() {
        let (_dir, store) = store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let lock = store.lock().unwrap();
                    let mut tunnels = lock.load().unwrap();
                    let name = format!("t{}", i);
                    tunnels.insert(
                        name.clone(),
                        TunnelRecord::new(&name, 3000 + i, 8000 + i, &name, "localhost"),
                    );
                    lock.save(&tunnels).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every read-modify-write survived
        assert_eq!(store.load().unwrap().len(), 8);
    }
}

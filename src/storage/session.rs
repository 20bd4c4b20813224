//! Session-scoped file backend
//!
//! Values live in a small TOML file under the per-user runtime directory
//! (`$XDG_RUNTIME_DIR` on Linux), which is wiped when the login session ends.
//! Platforms without a runtime directory fall back to the cache directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use directories::ProjectDirs;

use super::KeyValueBackend;
use crate::error::StorageError;

const SESSION_FILE: &str = "session.toml";

/// File-backed store whose lifetime matches the user's login session.
pub struct SessionBackend {
    path: PathBuf,
    // Serializes reads and read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl SessionBackend {
    /// Open (lazily) a session store at an explicit file path.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Session store in the default per-user location for `app`.
    pub fn default_location(app: &str) -> Result<Self, StorageError> {
        let dirs = ProjectDirs::from("com", app, app).ok_or(StorageError::NoDirectory)?;
        let dir = dirs
            .runtime_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.cache_dir().to_path_buf());
        Ok(Self::open(dir.join(SESSION_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| StorageError::Decode(e.to_string()))
    }

    /// Sibling file the next version is written to before it replaces `path`.
    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| SESSION_FILE.into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    /// Write the whole map to a temp file and rename it over the session
    /// file, so readers see either the old or the new contents.
    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content =
            toml::to_string_pretty(values).map_err(|e| StorageError::Encode(e.to_string()))?;

        let tmp = self.temp_path();
        let _ = fs::remove_file(&tmp);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        // Session file holds refresh tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let written = options.open(&tmp).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok(())
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StorageError> {
        self.lock.lock().map_err(|_| StorageError::Poisoned)
    }

    fn update(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<bool, StorageError> {
        let _guard = self.guard()?;
        let mut values = self.load()?;
        mutate(&mut values);
        self.save(&values)?;
        Ok(true)
    }
}

#[async_trait]
impl KeyValueBackend for SessionBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.guard()?;
        Ok(self.load()?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        tracing::debug!("session store write: {}", key);
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        if !self.path.exists() {
            return Ok(true);
        }
        self.update(|values| {
            values.remove(key);
        })
    }
}

//! Persistence slots for the flag cache.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ErrorCode, Result, RollgateError};
use crate::types::FlagSet;

/// The blob written to a storage slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFlags {
    pub flags: FlagSet,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Somewhere to keep the last flag set between process restarts.
pub trait CacheStorage: Send + Sync {
    /// Read the stored blob. A slot that was never written is `Ok(None)`.
    fn load(&self) -> Result<Option<PersistedFlags>>;

    fn save(&self, snapshot: &PersistedFlags) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// JSON file storage.
///
/// Writes go to a sibling temp file under an exclusive lock and are renamed
/// into place, so a concurrent reader sees either the old or the new blob.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CacheStorage for FileStorage {
    fn load(&self) -> Result<Option<PersistedFlags>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RollgateError::with_source(
                    ErrorCode::CacheReadError,
                    format!("failed to open cache file {}", self.path.display()),
                    e,
                ))
            }
        };

        file.lock_shared().map_err(|e| {
            RollgateError::with_source(ErrorCode::CacheReadError, "failed to lock cache file", e)
        })?;

        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        let _ = file.unlock();
        read.map_err(|e| {
            RollgateError::with_source(ErrorCode::CacheReadError, "failed to read cache file", e)
        })?;

        let snapshot = serde_json::from_str(&contents).map_err(|e| {
            RollgateError::with_source(ErrorCode::CacheInvalidData, "cache file is not valid JSON", e)
        })?;

        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &PersistedFlags) -> Result<()> {
        let write_error =
            |e: std::io::Error| RollgateError::with_source(ErrorCode::CacheWriteError, "failed to write cache file", e);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let json = serde_json::to_vec(snapshot).map_err(|e| {
            RollgateError::with_source(ErrorCode::CacheWriteError, "failed to encode cache", e)
        })?;

        let temp_path = self.temp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(write_error)?;

        file.lock_exclusive().map_err(write_error)?;
        let written = file.write_all(&json).and_then(|_| file.sync_all());
        let _ = file.unlock();
        written.map_err(write_error)?;

        fs::rename(&temp_path, &self.path).map_err(write_error)?;
        tracing::debug!("Persisted {} flags to {}", snapshot.flags.len(), self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RollgateError::with_source(
                ErrorCode::CacheWriteError,
                "failed to remove cache file",
                e,
            )),
        }
    }
}

/// In-process slot holding the serialized blob, for hosts that manage
/// their own storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw serialized contents of the slot.
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    pub fn set_raw(&self, contents: impl Into<String>) {
        *self.slot.lock() = Some(contents.into());
    }
}

impl CacheStorage for MemoryStorage {
    fn load(&self) -> Result<Option<PersistedFlags>> {
        match self.slot.lock().as_deref() {
            None => Ok(None),
            Some(contents) => serde_json::from_str(contents).map(Some).map_err(|e| {
                RollgateError::with_source(ErrorCode::CacheInvalidData, "stored cache is not valid JSON", e)
            }),
        }
    }

    fn save(&self, snapshot: &PersistedFlags) -> Result<()> {
        let json = serde_json::to_string(snapshot).map_err(|e| {
            RollgateError::with_source(ErrorCode::CacheWriteError, "failed to encode cache", e)
        })?;
        *self.slot.lock() = Some(json);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

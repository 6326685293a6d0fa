//! Durable state store backed by a single JSON document.
//!
//! Every mutation goes through [`StateStore::update`]: take the exclusive lock,
//! re-read the document from disk, apply the closure, stamp `lastUpdated`,
//! bound the activity log and replace the whole file. External workers write
//! the same document from other processes, so nothing here trusts an
//! in-memory copy for writes.
//!
//! Locking uses an advisory `fs2` lock on a sidecar `<state>.lock` file (the
//! data file itself is replaced by rename, so it cannot carry the lock). An
//! in-process async mutex additionally serializes writers that share a store.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::errors::TaskError;
//! use foreman::state::StateStore;
//!
//! # async fn demo() -> Result<(), TaskError> {
//! let store = StateStore::new(".foreman/state.json");
//! let polls = store
//!     .update(|state| {
//!         state.orchestrator.total_polls += 1;
//!         Ok::<_, TaskError>(state.orchestrator.total_polls)
//!     })
//!     .await?;
//! # let _ = polls;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::model::PipelineState;
use crate::errors::StoreError;

/// Lock retry and retention settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Retries after the first failed lock attempt
    pub lock_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Activity entries kept after each update
    pub activity_limit: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            lock_retries: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            activity_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Held advisory lock; released on drop.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Handle to the persisted pipeline document. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    settings: StoreSettings,
    writer: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let mut lock_name = state_file.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_file: PathBuf::from(lock_name),
            state_file,
            settings: StoreSettings::default(),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Current document, or `None` if the store was never initialized.
    pub async fn read(&self) -> Result<Option<PipelineState>, StoreError> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let _guard = self.acquire(LockMode::Shared).await?;
        self.read_unlocked()
    }

    /// Current document; `NotInitialized` if absent.
    pub async fn load(&self) -> Result<PipelineState, StoreError> {
        self.read().await?.ok_or_else(|| StoreError::NotInitialized {
            path: self.state_file.clone(),
        })
    }

    /// Apply `f` to the on-disk document under the exclusive lock.
    ///
    /// If `f` returns an error the document is left untouched. `f` runs at most once.
    pub async fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PipelineState) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _writer = self.writer.lock().await;
        let _guard = self.acquire(LockMode::Exclusive).await?;

        let mut state = self
            .read_unlocked()?
            .ok_or_else(|| StoreError::NotInitialized {
                path: self.state_file.clone(),
            })?;

        let out = f(&mut state)?;

        let now = Utc::now();
        state.last_updated = now;
        state.refresh_derived(now);
        state.truncate_activity(self.settings.activity_limit);
        self.write_unlocked(&state)?;
        Ok(out)
    }

    /// Create the document. Fails with `AlreadyInitialized` unless `overwrite` is set.
    pub async fn initialize(
        &self,
        mut state: PipelineState,
        overwrite: bool,
    ) -> Result<PipelineState, StoreError> {
        let _writer = self.writer.lock().await;
        let _guard = self.acquire(LockMode::Exclusive).await?;

        if self.state_file.exists() && !overwrite {
            return Err(StoreError::AlreadyInitialized {
                path: self.state_file.clone(),
            });
        }

        state.last_updated = Utc::now();
        state.truncate_activity(self.settings.activity_limit);
        self.write_unlocked(&state)?;
        debug!(path = %self.state_file.display(), "state initialized");
        Ok(state)
    }

    /// Delete the document. Returns false if there was nothing to delete.
    pub async fn reset(&self) -> Result<bool, StoreError> {
        if !self.state_file.exists() {
            return Ok(false);
        }
        let _writer = self.writer.lock().await;
        let _guard = self.acquire(LockMode::Exclusive).await?;
        match fs::remove_file(&self.state_file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: self.state_file.clone(),
                source,
            }),
        }
    }

    async fn acquire(&self, mode: LockMode) -> Result<LockGuard, StoreError> {
        if let Some(parent) = self.lock_file.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_file)
            .map_err(|source| StoreError::Io {
                path: self.lock_file.clone(),
                source,
            })?;

        let attempts = self.settings.lock_retries + 1;
        let mut delay = self.settings.min_backoff;
        let contended = fs2::lock_contended_error().raw_os_error();

        for attempt in 1..=attempts {
            let result = match mode {
                LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
                LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
            };
            match result {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.raw_os_error() == contended => {}
                Err(source) => {
                    return Err(StoreError::Io {
                        path: self.lock_file.clone(),
                        source,
                    });
                }
            }
            if attempt < attempts {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "state lock busy");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.settings.max_backoff);
            }
        }

        Err(StoreError::LockTimeout {
            path: self.state_file.clone(),
            attempts,
        })
    }

    fn read_unlocked(&self) -> Result<Option<PipelineState>, StoreError> {
        let content = match fs::read_to_string(&self.state_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.state_file.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: self.state_file.clone(),
                source,
            })
    }

    fn write_unlocked(&self, state: &PipelineState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;
        let mut tmp_name = self.state_file.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.state_file).map_err(|source| StoreError::Io {
            path: self.state_file.clone(),
            source,
        })
    }
}

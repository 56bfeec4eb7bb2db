//! # Result Store
//!
//! Persists the latest [`EvaluationRun`] as a JSON snapshot and the
//! subscription document listing fully unlocked endpoints. Both files are
//! replaced atomically (temp file in the same directory, then rename), so a
//! reader sees either the previous or the new version, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;

use super::error::PersistenceError;
use super::model::{Endpoint, EvaluationRun};
use crate::configs::app_config::StorageConfig;

/// Writes `contents` to `path` via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PersistenceError::io(dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| PersistenceError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| PersistenceError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;
    Ok(())
}

#[derive(Serialize)]
struct SubscriptionDocument {
    proxies: Vec<Endpoint>,
}

/// # Result Store
///
/// File-backed home of the latest snapshot and subscription.
#[derive(Debug, Clone)]
pub struct ResultStore {
    snapshot_path: PathBuf,
    subscription_path: PathBuf,
    suffix: String,
}

impl ResultStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            snapshot_path: storage.results_dir.join(&storage.snapshot_file),
            subscription_path: storage.results_dir.join(&storage.subscription_file),
            suffix: storage.subscription_suffix.clone(),
        }
    }

    /// Replaces the snapshot with `run`.
    pub fn save(&self, run: &EvaluationRun) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(run).map_err(|e| PersistenceError::Json {
            path: self.snapshot_path.clone(),
            source: e,
        })?;
        write_atomic(&self.snapshot_path, &json)?;
        info!(
            "Snapshot with {} results saved to {}",
            run.results().len(),
            self.snapshot_path.display()
        );
        Ok(())
    }

    /// The most recently saved run, `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<EvaluationRun>, PersistenceError> {
        let bytes = match fs::read(&self.snapshot_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::io(&self.snapshot_path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PersistenceError::Json {
                path: self.snapshot_path.clone(),
                source: e,
            })
    }

    /// Raw snapshot bytes for download.
    pub fn downloadable_snapshot(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(&self.snapshot_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(&self.snapshot_path, e)),
        }
    }

    /// Renders the subscription document for `run`: `full` endpoints only,
    /// original fields kept, names suffixed.
    pub fn render_subscription(&self, run: &EvaluationRun) -> Result<String, PersistenceError> {
        let proxies = run
            .full_endpoints()
            .map(|endpoint| {
                let mut renamed = endpoint.clone();
                renamed.name.push_str(&self.suffix);
                renamed
            })
            .collect();
        let document = SubscriptionDocument { proxies };
        serde_yml::to_string(&document).map_err(|e| PersistenceError::Yaml {
            path: self.subscription_path.clone(),
            source: e,
        })
    }

    /// Replaces the subscription file. An empty list is still written.
    pub fn save_subscription(&self, run: &EvaluationRun) -> Result<usize, PersistenceError> {
        let yaml = self.render_subscription(run)?;
        write_atomic(&self.subscription_path, yaml.as_bytes())?;
        let count = run.full_endpoints().count();
        info!(
            "Subscription with {} endpoints saved to {}",
            count,
            self.subscription_path.display()
        );
        Ok(count)
    }

    /// Current subscription document, if one was written.
    pub fn subscription(&self) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(&self.subscription_path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(&self.subscription_path, e)),
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use crate::util::blocking;
use crate::{mlog_debug, Error, Result};

use super::{SystemState, STATE_VERSION};

/// Durable home of the [`SystemState`] snapshot.
///
/// Every save writes a temporary sibling and renames it over the snapshot,
/// so a reader never sees a half-written file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the snapshot, or `None` when there is none yet.
    ///
    /// # Errors
    /// Returns `Error::Validation` for a snapshot written by a newer version,
    /// and JSON errors for a corrupt file.
    pub fn load(&self) -> Result<Option<SystemState>> {
        mlog_debug!("StateStore::load path={}", self.path.display());
        if !self.path.exists() {
            mlog_debug!("Snapshot not found");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let state: SystemState = serde_json::from_str(&contents)?;
        if state.version > STATE_VERSION {
            return Err(Error::Validation(format!(
                "snapshot version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }
        mlog_debug!(
            "Snapshot loaded: run={} phase={} tasks={}",
            state.run_id,
            state.phase,
            state.graph.task_count()
        );
        Ok(Some(state))
    }

    pub fn save_sync(&self, state: &SystemState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, &contents)
    }

    /// Serialize on the caller, write on the blocking pool.
    pub async fn save(&self, state: &SystemState) -> Result<()> {
        let contents = serde_json::to_string_pretty(state)?;
        let path = self.path.clone();
        blocking(move || write_atomic(&path, &contents)).await
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    mlog_debug!("Snapshot saved: {}", path.display());
    Ok(())
}

//! JSON snapshot files, one per run.

use crate::core::dag::GraphSnapshot;
use crate::orchestration::budget::LedgerSnapshot;
use crate::orchestration::recovery::RecoveryDecision;
use crate::core::task::TaskId;
use crate::{clog_debug, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub graph: GraphSnapshot,
    pub ledger: LedgerSnapshot,
    /// Recovery decisions taken so far, oldest first.
    #[serde(default)]
    pub decisions: Vec<(TaskId, RecoveryDecision)>,
}

/// Writes snapshots atomically under a directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("run-{}.json", run_id))
    }

    /// Write via a temporary file and rename, so a crash never leaves a torn snapshot.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&snapshot.run_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        clog_debug!(
            "SnapshotStore::save run={} tasks={}",
            snapshot.run_id,
            snapshot.graph.tasks.len()
        );
        Ok(())
    }

    pub fn load(&self, run_id: &Uuid) -> Result<Option<RunSnapshot>> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// The most recently saved snapshot in the directory, if any.
    pub fn latest(&self) -> Result<Option<RunSnapshot>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<RunSnapshot> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run-") && n.ends_with(".json"));
            if !is_snapshot {
                continue;
            }
            let snapshot: RunSnapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if latest.as_ref().is_none_or(|l| snapshot.saved_at > l.saved_at) {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }
}

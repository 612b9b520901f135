//! Task-scoped copies of the project for running checks.
//!
//! A task's checks have to see the project as it would look with that task's
//! changes applied, but the working tree only changes once a task is DONE.
//! An [`Overlay`] copies the project into `<root>/<task_id>/`, applies the
//! proposed changes to the copy and removes it after the checks ran.
//!
//! Version control metadata and build output (`.git`, `target`) are not
//! copied, nor is anything under an excluded directory such as the staging
//! root.

use crate::core::task::TaskId;
use crate::git::apply_changes;
use crate::orchestration::parser::CodeChange;
use crate::util::blocking;
use crate::{clog_debug, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under the staging root that holds overlays. Task ids start
/// with an alphanumeric character, so it never collides with a staging area.
pub const OVERLAY_DIR: &str = ".verify";

const SKIPPED: &[&str] = &[".git", "target"];

#[derive(Debug, Clone)]
pub struct Overlay {
    project: PathBuf,
    root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl Overlay {
    pub fn new(project: PathBuf, root: PathBuf) -> Self {
        Self {
            project,
            root,
            excluded: Vec::new(),
        }
    }

    /// Never copy `dir`, even when it lies inside the project.
    pub fn excluding(mut self, dir: PathBuf) -> Self {
        self.excluded.push(dir);
        self
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.as_str())
    }

    /// Build a fresh overlay for `task_id` and return its path.
    pub async fn prepare(&self, task_id: &TaskId, changes: Vec<CodeChange>) -> Result<PathBuf> {
        let project = self.project.clone();
        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let dir = self.path_for(task_id);
        let target = dir.clone();

        blocking(move || {
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            fs::create_dir_all(&target)?;

            let project = project.canonicalize()?;
            let mut skip = vec![root.canonicalize()?];
            skip.extend(excluded.iter().filter_map(|dir| dir.canonicalize().ok()));

            let copied = copy_tree(&project, &target, &skip)?;
            let touched = apply_changes(&target, &changes)?;
            clog_debug!(
                "Overlay {}: {} files copied, {} changed",
                target.display(),
                copied,
                touched.len()
            );
            Ok(())
        })
        .await?;
        Ok(dir)
    }

    pub async fn discard(&self, task_id: &TaskId) -> Result<()> {
        let dir = self.path_for(task_id);
        blocking(move || {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
        .await
    }
}

fn copy_tree(from: &Path, to: &Path, skip: &[PathBuf]) -> Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if SKIPPED.iter().any(|s| name == *s) || skip.iter().any(|s| *s == path) {
            continue;
        }
        let dest = to.join(&name);
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&dest)?;
            copied += copy_tree(&path, &dest, skip)?;
        } else if path.is_file() {
            // follows links to files; links to directories are left out
            fs::copy(&path, &dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

//! Applying verified changes to the working tree.
//!
//! Only tasks that reached DONE are committed, one at a time, by the
//! orchestrator after a dispatch round has drained.

use crate::core::task::Task;
use crate::orchestration::parser::{ChangeAction, CodeChange};
use crate::{clog_debug, Error, Result};
use git2::{ErrorCode, Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes a finished task's changes somewhere durable.
pub trait Committer: Send {
    /// Apply `changes` for `task`; returns an identifier of what was recorded,
    /// or `None` when there was nothing to record.
    fn commit(&mut self, task: &Task, changes: &[CodeChange]) -> Result<Option<String>>;
}

/// Commits each finished task to a git repository.
#[derive(Debug, Clone)]
pub struct GitCommitter {
    repo_path: PathBuf,
}

impl GitCommitter {
    pub fn new(repo_path: &Path) -> Result<Self> {
        Repository::open(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}

/// Write `changes` under `root`; returns the relative paths touched.
pub(crate) fn apply_changes(root: &Path, changes: &[CodeChange]) -> Result<Vec<PathBuf>> {
    let mut touched = Vec::with_capacity(changes.len());
    for change in changes {
        let relative = change.relative_path().ok_or_else(|| {
            Error::Validation(format!("change path {} leaves the repository", change.path))
        })?;
        let target = root.join(relative);
        match change.action {
            ChangeAction::Delete => {
                if target.exists() {
                    fs::remove_file(&target)?;
                }
            }
            ChangeAction::Create | ChangeAction::Modify => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, &change.content)?;
            }
        }
        touched.push(relative.to_path_buf());
    }
    Ok(touched)
}

impl Committer for GitCommitter {
    fn commit(&mut self, task: &Task, changes: &[CodeChange]) -> Result<Option<String>> {
        clog_debug!(
            "GitCommitter::commit task={} changes={} repo={}",
            task.id,
            changes.len(),
            self.repo_path.display()
        );
        let touched = apply_changes(&self.repo_path, changes)?;

        let repo = self.repo()?;
        let mut index = repo.index()?;
        for path in &touched {
            if self.repo_path.join(path).exists() {
                index.add_path(path)?;
            } else if index.get_path(path, 0).is_some() {
                index.remove_path(path)?;
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_id) {
            clog_debug!("GitCommitter: nothing to commit for {}", task.id);
            return Ok(None);
        }

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("conductor", "conductor@localhost"))?;
        let message = format!("{}: {}", task.id, task.title);
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)?;
        clog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id.to_string()))
    }
}

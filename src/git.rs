//! Version control plumbing.
//!
//! The orchestrator only ever creates branches and merges one branch into
//! another, so `VersionControl` is deliberately small. `GitOps` implements it
//! with git2 operating on refs alone: merges are computed in memory and never
//! touch a working tree, which leaves worktree management to the engine.

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, Repository, Signature};

use crate::{alog_debug, Error, Result};

/// A file left conflicted by a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFile {
    pub path: PathBuf,
    /// Content on the parent branch.
    pub ours: String,
    /// Content on the child branch.
    pub theirs: String,
    /// Common ancestor content, if the file existed there.
    pub base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { commit: String },
    Conflict { files: Vec<ConflictFile> },
}

/// Branch operations consumed by the orchestrator.
pub trait VersionControl: Send + Sync {
    /// Create `name` at the tip of `base`. Fails if `name` already exists.
    fn create_branch(&self, base: &str, name: &str) -> Result<String>;

    fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Remove a branch that was created but never handed out.
    fn delete_branch(&self, name: &str) -> Result<()>;

    /// Merge `child` into `parent`, moving `parent` on success.
    fn merge(&self, child: &str, parent: &str) -> Result<MergeOutcome>;
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        alog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Commit id at the tip of a local branch.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let result = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Ok(Some(b.get().peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }

    fn extract_conflicts(repo: &Repository, index: &git2::Index) -> Result<Vec<ConflictFile>> {
        let mut conflicts = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let path = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).to_string())
                .unwrap_or_default();

            let ours = Self::read_blob(repo, conflict.our.as_ref().map(|e| e.id))?;
            let theirs = Self::read_blob(repo, conflict.their.as_ref().map(|e| e.id))?;
            let base = Self::read_blob(repo, conflict.ancestor.as_ref().map(|e| e.id))?;

            conflicts.push(ConflictFile {
                path: PathBuf::from(path),
                ours: ours.unwrap_or_default(),
                theirs: theirs.unwrap_or_default(),
                base,
            });
        }
        Ok(conflicts)
    }

    fn read_blob(repo: &Repository, oid: Option<git2::Oid>) -> Result<Option<String>> {
        match oid {
            Some(id) if !id.is_zero() => {
                let blob = repo.find_blob(id)?;
                Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
            }
            _ => Ok(None),
        }
    }
}

impl VersionControl for GitOps {
    fn create_branch(&self, base: &str, name: &str) -> Result<String> {
        alog_debug!("GitOps::create_branch base={} name={}", base, name);
        if !git2::Branch::name_is_valid(name)? {
            return Err(Error::BranchCreateFailed {
                name: name.to_string(),
                reason: "not a valid branch name".to_string(),
            });
        }
        let repo = self.repo()?;
        let commit = repo.revparse_single(base)?.peel_to_commit()?;
        let result = match repo.branch(name, &commit, false) {
            Ok(_) => {
                alog_debug!("Created branch {} at {}", name, commit.id());
                Ok(name.to_string())
            }
            Err(e) if e.code() == ErrorCode::Exists => Err(Error::BranchCreateFailed {
                name: name.to_string(),
                reason: "branch already exists".to_string(),
            }),
            Err(e) => Err(e.into()),
        };
        result
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = match repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        result
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        alog_debug!("GitOps::delete_branch name={}", name);
        let repo = self.repo()?;
        repo.find_branch(name, BranchType::Local)?.delete()?;
        Ok(())
    }

    fn merge(&self, child: &str, parent: &str) -> Result<MergeOutcome> {
        alog_debug!("GitOps::merge child={} parent={}", child, parent);
        let repo = self.repo()?;
        let parent_ref = format!("refs/heads/{}", parent);
        let ours = repo.find_branch(parent, BranchType::Local)?.get().peel_to_commit()?;
        let theirs = repo.find_branch(child, BranchType::Local)?.get().peel_to_commit()?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            alog_debug!("{} already contains {}", parent, child);
            return Ok(MergeOutcome::Merged {
                commit: ours.id().to_string(),
            });
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(
                &parent_ref,
                theirs.id(),
                true,
                &format!("arbor: fast-forward {} to {}", parent, child),
            )?;
            alog_debug!("Fast-forwarded {} to {}", parent, theirs.id());
            return Ok(MergeOutcome::Merged {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let files = Self::extract_conflicts(&repo, &index)?;
            alog_debug!("Merge {} -> {} has {} conflict(s)", child, parent, files.len());
            return Ok(MergeOutcome::Conflict { files });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Arbor", "arbor@localhost"))?;
        let commit_id = repo.commit(
            Some(&parent_ref),
            &sig,
            &sig,
            &format!("Merge branch '{}' into {}", child, parent),
            &tree,
            &[&ours, &theirs],
        )?;
        alog_debug!("Merge commit created: {}", commit_id);
        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, RepositoryState, Signature};

use crate::core::task::TaskId;
use crate::core::worker::Workspace;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Branch namespace for task branches.
pub const BRANCH_PREFIX: &str = "maestro";

/// Isolated, branch-scoped checkouts for tasks.
///
/// All methods block. The orchestrator calls them through
/// `util::blocking_with_timeout`.
pub trait BranchIsolation: Send + Sync {
    /// Fresh workspace for `task_id`, branched from `base`. A leftover
    /// workspace for the same task is replaced.
    fn create(&self, task_id: &TaskId, base: &str) -> Result<Workspace>;

    /// Remove the task's checkout. The branch is kept.
    fn remove(&self, task_id: &TaskId) -> Result<()>;

    /// Paths (relative to the workspace root) with unresolved conflicts.
    fn list_conflicts(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Merge `base` into the task branch, leaving conflicts in the tree.
    fn sync(&self, workspace: &Workspace, base: &str) -> Result<SyncOutcome>;

    /// Conclude a pending merge and fast-forward `base` to the task branch.
    fn integrate(&self, workspace: &Workspace, base: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    FastForward,
    /// A merge is in progress; conflicts may be present.
    Merged,
}

pub struct GitOps {
    repo_path: PathBuf,
    worktree_dir: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path, worktree_dir: &Path) -> Result<Self> {
        mlog_debug!(
            "GitOps::new path={} worktrees={}",
            repo_path.display(),
            worktree_dir.display()
        );
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self {
            repo_path: root,
            worktree_dir: worktree_dir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch_name(task_id: &TaskId) -> String {
        format!("{}/{}", BRANCH_PREFIX, task_id.slug())
    }

    pub fn worktree_path(&self, task_id: &TaskId) -> PathBuf {
        self.worktree_dir.join(task_id.slug())
    }

    /// Short name of the branch HEAD points at.
    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        Err(Error::Validation(
            "HEAD is detached; pass a base branch explicitly".to_string(),
        ))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        match self.repo()?.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the worktree at `worktree_path`: prune its registration, delete
    /// the checkout and delete the admin directory under `.git/worktrees`.
    ///
    /// A leftover admin directory keeps the branch marked as checked out and
    /// the next `create` for the task would fail, so every step is attempted
    /// even when an earlier one fails.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        mlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let folder = worktree_path.file_name().and_then(|n| n.to_str());

        let mut admin_names: Vec<String> = folder.map(String::from).into_iter().collect();
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if Some(name) != folder && worktree.path() != worktree_path {
                continue;
            }
            let _ = worktree.unlock();
            let mut opts = git2::WorktreePruneOptions::new();
            opts.valid(true).working_tree(true).locked(true);
            if let Err(e) = worktree.prune(Some(&mut opts)) {
                mlog_warn!("prune of worktree {} failed: {}", name, e);
            }
            if Some(name) != folder {
                admin_names.push(name.to_string());
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        for name in admin_names {
            let admin = repo.path().join("worktrees").join(&name);
            if admin.exists() {
                mlog_debug!("removing stale worktree admin dir {}", admin.display());
                let _ = std::fs::remove_dir_all(&admin);
            }
        }
        Ok(())
    }

    /// Stage everything in a worktree and commit it.
    ///
    /// Returns `false` when there was nothing to commit.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<bool> {
        mlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                mlog_debug!("commit_all: nothing to commit");
                return Ok(false);
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        mlog_debug!("Commit created: {}", commit_id);
        Ok(true)
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("Maestro", "maestro@localhost"))?)
}

fn merge_heads(repo: &mut Repository) -> Result<Vec<Oid>> {
    let mut heads = Vec::new();
    if repo.state() != RepositoryState::Merge {
        return Ok(heads);
    }
    repo.mergehead_foreach(|oid| {
        heads.push(*oid);
        true
    })?;
    Ok(heads)
}

impl BranchIsolation for GitOps {
    fn create(&self, task_id: &TaskId, base: &str) -> Result<Workspace> {
        let branch = Self::branch_name(task_id);
        let path = self.worktree_path(task_id);
        mlog_debug!(
            "GitOps::create task={} branch={} path={}",
            task_id,
            branch,
            path.display()
        );

        // Leftover from an earlier attempt or a crashed run.
        self.remove_worktree(&path)?;
        std::fs::create_dir_all(&self.worktree_dir)?;

        let repo = self.repo()?;
        let base_commit = repo.revparse_single(base)?.peel_to_commit()?;
        let branch_ref = repo.branch(&branch, &base_commit, true)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(&task_id.slug(), &path, Some(&opts))?;
        mlog_debug!("Worktree created from {} at {}", base, base_commit.id());

        Ok(Workspace { path, branch })
    }

    fn remove(&self, task_id: &TaskId) -> Result<()> {
        self.remove_worktree(&self.worktree_path(task_id))
    }

    fn list_conflicts(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(path)?;
        let index = repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }

        let mut files = BTreeSet::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref());
            if let Some(entry) = entry {
                files.insert(PathBuf::from(
                    String::from_utf8_lossy(&entry.path).into_owned(),
                ));
            }
        }
        Ok(files.into_iter().collect())
    }

    fn sync(&self, workspace: &Workspace, base: &str) -> Result<SyncOutcome> {
        mlog_debug!(
            "GitOps::sync branch={} base={}",
            workspace.branch,
            base
        );
        let repo = Repository::open(&workspace.path)?;
        let base_commit = repo.revparse_single(base)?.peel_to_commit()?;
        let annotated = repo.find_annotated_commit(base_commit.id())?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(SyncOutcome::UpToDate);
        }

        if analysis.is_fast_forward() {
            repo.checkout_tree(base_commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
            let mut head = repo.head()?;
            head.set_target(base_commit.id(), &format!("maestro: fast-forward to {}", base))?;
            return Ok(SyncOutcome::FastForward);
        }

        let mut checkout = CheckoutBuilder::new();
        checkout.allow_conflicts(true).conflict_style_diff3(true);
        repo.merge(&[&annotated], None, Some(&mut checkout))?;
        Ok(SyncOutcome::Merged)
    }

    fn integrate(&self, workspace: &Workspace, base: &str) -> Result<()> {
        mlog_debug!(
            "GitOps::integrate branch={} base={}",
            workspace.branch,
            base
        );
        let mut repo = Repository::open(&workspace.path)?;
        let heads = merge_heads(&mut repo)?;

        // Files resolved in the tree still carry conflict stages in the index.
        let conflicted = self.list_conflicts(&workspace.path)?;
        let mut index = repo.index()?;
        for path in &conflicted {
            if workspace.path.join(path).exists() {
                index.add_path(path)?;
            } else {
                index.remove_path(path)?;
            }
        }
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        if index.has_conflicts() {
            return Err(Error::ConflictUnresolved {
                level: 2,
                reason: "index still has conflicts".to_string(),
            });
        }

        let tree = repo.find_tree(index.write_tree()?)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        if !heads.is_empty() || tree.id() != head_commit.tree_id() {
            let mut parents = vec![head_commit.clone()];
            for oid in &heads {
                parents.push(repo.find_commit(*oid)?);
            }
            let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
            let sig = signature(&repo)?;
            let message = if heads.is_empty() {
                format!("maestro: finalize {}", workspace.branch)
            } else {
                format!("Merge {} into {}", base, workspace.branch)
            };
            repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parent_refs)?;
        }
        repo.cleanup_state()?;

        let task_tip = repo.head()?.peel_to_commit()?.id();

        let main = self.repo()?;
        let mut base_ref = main.find_reference(&format!("refs/heads/{}", base))?;
        let base_tip = base_ref.peel_to_commit()?.id();
        if base_tip == task_tip {
            return Ok(());
        }
        if !main.graph_descendant_of(task_tip, base_tip)? {
            return Err(Error::Validation(format!(
                "{} is not a descendant of {}",
                workspace.branch, base
            )));
        }

        let head_on_base = main
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(|s| s == base))
            .unwrap_or(false);
        if head_on_base && !main.is_bare() {
            // Update the main checkout before moving the ref so local edits are respected.
            let target = main.find_commit(task_tip)?;
            main.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
        }
        base_ref.set_target(task_tip, &format!("maestro: integrate {}", workspace.branch))?;
        mlog_debug!("{} fast-forwarded to {}", base, task_tip);
        Ok(())
    }
}

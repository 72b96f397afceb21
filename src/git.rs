use std::fs;
use std::path::Path;

use git2::{BranchType, ErrorCode, Repository, WorktreeAddOptions, WorktreePruneOptions};

use crate::error::{MusterError, Result};

/// Information about the current HEAD: branch name and commit SHA.
pub struct HeadInfo {
    pub branch: Option<String>,
    pub sha: String,
}

/// Retrieve the current HEAD's branch name and commit SHA.
/// Returns None if the repo root is not inside a git repository.
pub fn current_head_info(repo_root: &Path) -> Option<HeadInfo> {
    let repo = Repository::discover(repo_root).ok()?;
    let head = repo.head().ok()?;
    let branch = if head.is_branch() {
        head.shorthand().map(String::from)
    } else {
        None
    };
    let sha = head.peel_to_commit().ok()?.id().to_string();
    Some(HeadInfo { branch, sha })
}

/// Create `branch` at the current HEAD and check it out in a new linked
/// worktree at `path`, registered under `worktree_name`.
///
/// Fails with `WorkspaceConflict` if the branch, the worktree or anything at
/// `path` already exists. On failure nothing created here is left behind.
pub fn add_worktree(repo_root: &Path, worktree_name: &str, branch: &str, path: &Path) -> Result<()> {
    if path.exists() {
        return Err(MusterError::WorkspaceConflict(format!(
            "workspace path {} already exists",
            path.display()
        )));
    }
    let repo = Repository::discover(repo_root)?;
    if repo.find_branch(branch, BranchType::Local).is_ok() {
        return Err(MusterError::WorkspaceConflict(format!(
            "branch {branch} already exists"
        )));
    }
    let head = repo.head()?.peel_to_commit()?;

    // No branch exists yet, so this failure needs no undo.
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let created = repo
        .branch(branch, &head, false)
        .map_err(|err| conflict_or_git(err, format!("branch {branch} already exists")))?;

    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(created.get()));
    if let Err(err) = repo.worktree(worktree_name, path, Some(&opts)) {
        drop(opts);
        if path.exists() {
            let _ = fs::remove_dir_all(path);
        }
        if let Ok(mut branch_ref) = repo.find_branch(branch, BranchType::Local) {
            let _ = branch_ref.delete();
        }
        return Err(conflict_or_git(
            err,
            format!("worktree {worktree_name} already exists"),
        ));
    }
    tracing::info!(branch, path = %path.display(), "added worktree");
    Ok(())
}

fn conflict_or_git(err: git2::Error, what: String) -> MusterError {
    if err.code() == ErrorCode::Exists {
        MusterError::WorkspaceConflict(what)
    } else {
        MusterError::Git(err)
    }
}

/// Remove the worktree at `path` and delete `branch`. Each part is skipped
/// if already gone, so this is safe on half-created or half-removed state.
pub fn remove_worktree(
    repo_root: &Path,
    worktree_name: &str,
    branch: &str,
    path: &Path,
) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }

    // Without a repository there is no worktree or branch left to remove.
    let Ok(repo) = Repository::discover(repo_root) else {
        return Ok(());
    };
    if let Ok(worktree) = repo.find_worktree(worktree_name) {
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true).working_tree(true);
        worktree.prune(Some(&mut opts))?;
    }

    if let Ok(mut branch_ref) = repo.find_branch(branch, BranchType::Local) {
        branch_ref.delete()?;
    }
    tracing::info!(branch, path = %path.display(), "removed worktree");
    Ok(())
}

pub fn is_git_repository(path: &Path) -> bool {
    Repository::discover(path).is_ok()
}

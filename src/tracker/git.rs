use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{BranchType, Commit, DiffFormat, Repository, Signature};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, warn};

/// Result of merging a task branch into the main branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A merge commit was created on the main branch.
    Merged { commit: String },
    /// The main branch already contains the branch.
    UpToDate,
    /// The merge would conflict; nothing was written.
    Conflict { paths: Vec<String> },
}

/// Abstraction over branch integration for testability.
#[async_trait]
pub trait GitIntegration: Send + Sync {
    /// Merge `branch` into the main branch with a merge commit and delete it.
    async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome>;

    /// Changes on `branch` since it forked from the main branch, as a patch.
    async fn diff(&self, branch: &str) -> Result<String>;

    /// Push the main branch to `origin`.
    async fn push_main(&self) -> Result<()>;
}

pub struct GitTracker {
    project_dir: PathBuf,
    main_branch: String,
}

impl GitTracker {
    pub fn new(project_dir: &Path, main_branch: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            main_branch: main_branch.into(),
        }
    }

    // Repository is not Sync, so each operation opens its own handle.
    fn open(&self) -> Result<Repository> {
        Repository::open(&self.project_dir).with_context(|| {
            format!(
                "Failed to open git repository at {}",
                self.project_dir.display()
            )
        })
    }

    fn main_ref(&self) -> String {
        format!("refs/heads/{}", self.main_branch)
    }

    fn main_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        repo.find_reference(&self.main_ref())
            .and_then(|r| r.peel_to_commit())
            .with_context(|| format!("Main branch '{}' not found", self.main_branch))
    }

    fn branch_commit<'r>(repo: &'r Repository, branch: &str) -> Result<Commit<'r>> {
        repo.find_branch(branch, BranchType::Local)
            .and_then(|b| b.get().peel_to_commit())
            .with_context(|| format!("Branch '{}' not found", branch))
    }

    fn delete_branch(repo: &Repository, branch: &str) {
        let result = repo
            .find_branch(branch, BranchType::Local)
            .and_then(|mut b| b.delete());
        if let Err(e) = result {
            warn!(branch, error = %e, "could not delete merged branch");
        }
    }

    fn head_is_main(&self, repo: &Repository) -> bool {
        repo.head()
            .ok()
            .and_then(|h| h.name().map(|n| n == self.main_ref()))
            .unwrap_or(false)
    }

    fn merge_sync(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        let repo = self.open()?;
        let main = self.main_commit(&repo)?;
        let theirs = Self::branch_commit(&repo, branch)?;

        if main.id() == theirs.id() || repo.graph_descendant_of(main.id(), theirs.id())? {
            Self::delete_branch(&repo, branch);
            return Ok(MergeOutcome::UpToDate);
        }

        let mut index = repo
            .merge_commits(&main, &theirs, None)
            .context("Failed to compute merge")?;
        if index.has_conflicts() {
            let mut paths = BTreeSet::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            return Ok(MergeOutcome::Conflict {
                paths: paths.into_iter().collect(),
            });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;

        // Update the checkout before moving the ref so the safe checkout
        // compares against the old HEAD.
        if self.head_is_main(&repo) {
            repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe()))
                .context("Failed to update working tree for merge")?;
        }

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("foreman", "foreman@localhost"))?;
        let commit = repo.commit(
            Some(&self.main_ref()),
            &sig,
            &sig,
            message,
            &tree,
            &[&main, &theirs],
        )?;
        debug!(branch, %commit, "merge commit created");

        Self::delete_branch(&repo, branch);
        Ok(MergeOutcome::Merged {
            commit: commit.to_string(),
        })
    }

    fn diff_sync(&self, branch: &str) -> Result<String> {
        let repo = self.open()?;
        let main = self.main_commit(&repo)?;
        let theirs = Self::branch_commit(&repo, branch)?;
        let base = repo
            .merge_base(main.id(), theirs.id())
            .with_context(|| format!("Branch '{}' shares no history with main", branch))?;
        let base_tree = repo.find_commit(base)?.tree()?;
        let branch_tree = theirs.tree()?;

        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&branch_tree), None)?;
        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[async_trait]
impl GitIntegration for GitTracker {
    async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        self.merge_sync(branch, message)
    }

    async fn diff(&self, branch: &str) -> Result<String> {
        self.diff_sync(branch)
    }

    async fn push_main(&self) -> Result<()> {
        let output = tokio::process::Command::new("git")
            .args(["push", "origin", self.main_branch.as_str()])
            .current_dir(&self.project_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run git push")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git push failed: {}", stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::RepositoryInitOptions;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        commit_file(dir.path(), "README.md", "# shop\n", "init");
        (GitTracker::new(dir.path(), "main"), dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parents: Vec<Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap();
    }

    fn checkout(dir: &Path, branch: &str, create: bool) {
        let repo = Repository::open(dir).unwrap();
        if create {
            let head = repo.head().unwrap().peel_to_commit().unwrap();
            repo.branch(branch, &head, false).unwrap();
        }
        let refname = format!("refs/heads/{}", branch);
        let obj = repo.revparse_single(&refname).unwrap();
        repo.checkout_tree(&obj, Some(CheckoutBuilder::new().force()))
            .unwrap();
        repo.set_head(&refname).unwrap();
    }

    #[tokio::test]
    async fn test_merge_creates_merge_commit_and_deletes_branch() {
        let (git, dir) = setup_repo();
        checkout(dir.path(), "foreman/auth-001", true);
        commit_file(dir.path(), "schema.sql", "create table users();\n", "users table");
        checkout(dir.path(), "main", false);
        commit_file(dir.path(), "notes.md", "notes\n", "unrelated");

        let outcome = git.merge("foreman/auth-001", "Merge auth-001").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { .. }));

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.parent_count(), 2);
        assert_eq!(head.message(), Some("Merge auth-001"));
        assert!(dir.path().join("schema.sql").exists());
        assert!(
            repo.find_branch("foreman/auth-001", BranchType::Local)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_merge_never_fast_forwards() {
        let (git, dir) = setup_repo();
        checkout(dir.path(), "foreman/auth-002", true);
        commit_file(dir.path(), "api.rs", "fn login() {}\n", "login");
        checkout(dir.path(), "main", false);

        let outcome = git.merge("foreman/auth-002", "Merge auth-002").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged { .. }));
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.parent_count(), 2);
    }

    #[tokio::test]
    async fn test_merge_reports_conflicting_paths() {
        let (git, dir) = setup_repo();
        checkout(dir.path(), "foreman/auth-003", true);
        commit_file(dir.path(), "README.md", "# branch\n", "branch edit");
        checkout(dir.path(), "main", false);
        commit_file(dir.path(), "README.md", "# main\n", "main edit");

        let repo = Repository::open(dir.path()).unwrap();
        let before = repo.head().unwrap().peel_to_commit().unwrap().id();

        let outcome = git.merge("foreman/auth-003", "Merge auth-003").await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflict {
                paths: vec!["README.md".into()]
            }
        );
        let after = repo.head().unwrap().peel_to_commit().unwrap().id();
        assert_eq!(before, after);
        assert!(
            repo.find_branch("foreman/auth-003", BranchType::Local)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_merge_up_to_date_branch() {
        let (git, dir) = setup_repo();
        checkout(dir.path(), "foreman/auth-004", true);
        checkout(dir.path(), "main", false);
        let outcome = git.merge("foreman/auth-004", "noop").await.unwrap();
        assert_eq!(outcome, MergeOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_merge_missing_branch_is_error() {
        let (git, _dir) = setup_repo();
        assert!(git.merge("foreman/nope", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_diff_shows_branch_changes_only() {
        let (git, dir) = setup_repo();
        checkout(dir.path(), "foreman/cart-001", true);
        commit_file(dir.path(), "cart.sql", "create table carts();\n", "carts");
        checkout(dir.path(), "main", false);
        commit_file(dir.path(), "main_only.txt", "main\n", "main work");

        let diff = git.diff("foreman/cart-001").await.unwrap();
        assert!(diff.contains("cart.sql"));
        assert!(diff.contains("+create table carts();"));
        assert!(!diff.contains("main_only.txt"));
    }
}

//! Per-commit worktrees: create, configure, sanity-check, remove.
//!
//! A worktree lives at `<root>/.worktrees/<hash>` and is either absent or
//! fully checked out at exactly that hash; anything in between is treated as
//! damage and removed. Checkout is deliberately split from creation: the
//! worktree is added with `--no-checkout` and files only appear at the
//! `reset --hard` step, after its configuration is in place.

use std::fs;
use std::sync::Arc;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{RepoConfig, SubmodulesMode};
use crate::paths::{dir_is_empty, mkdir_all, relative_to, AbsPath};
use crate::runner::{CommandRunner, Deadline};

/// A worktree directory for one commit. May or may not exist on disk.
///
/// The directory's basename is the commit hash; that association is what the
/// published link exposes to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    path: AbsPath,
}

impl Worktree {
    pub fn at(path: AbsPath) -> Self {
        Self { path }
    }

    /// The commit hash this worktree is for.
    pub fn hash(&self) -> String {
        self.path.base()
    }

    pub fn path(&self) -> &AbsPath {
        &self.path
    }
}

impl std::fmt::Display for Worktree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Creates and maintains worktrees under the repo root.
pub struct WorktreeManager {
    cfg: Arc<RepoConfig>,
    runner: CommandRunner,
}

impl WorktreeManager {
    pub fn new(cfg: Arc<RepoConfig>, runner: CommandRunner) -> Self {
        Self { cfg, runner }
    }

    async fn git(
        &self,
        deadline: Deadline,
        cwd: &AbsPath,
        args: &[&str],
    ) -> Result<String, crate::runner::RunnerError> {
        let out = self
            .runner
            .run(deadline, Some(cwd), &self.cfg.git_cmd, args)
            .await?;
        Ok(out.stdout)
    }

    /// The worktree value for a hash. Callers must not assume anything about
    /// the on-disk layout beyond what this returns.
    pub fn worktree_for(&self, hash: &str) -> Worktree {
        Worktree::at(self.cfg.worktrees_dir().join(hash))
    }

    /// Create a fresh worktree for `hash`, without checking out files yet.
    pub async fn create(&self, deadline: Deadline, hash: &str) -> Result<Worktree> {
        let worktree = self.worktree_for(hash);

        // A prior crash can leave a half-built directory at this path, which
        // would make `worktree add` fail with "already exists". Clear it.
        self.remove(deadline, &worktree).await?;

        info!(path = %worktree, hash, "adding worktree");
        self.git(
            deadline,
            &self.cfg.root,
            &[
                "worktree",
                "add",
                "--force",
                "--detach",
                &worktree.path().to_string(),
                hash,
                "--no-checkout",
            ],
        )
        .await
        .wrap_err("git worktree add failed")?;

        Ok(worktree)
    }

    /// Apply per-worktree configuration and materialize the files.
    ///
    /// Safe to re-run on an existing worktree; the sync loop does exactly
    /// that when only settings (not the hash) may have changed.
    pub async fn configure(&self, deadline: Deadline, worktree: &Worktree) -> Result<()> {
        let hash = worktree.hash();

        // The .git file points back into <root>/.git/worktrees/<hash>.
        // Rewrite it with a relative path so the pair of directories can be
        // mounted at a different location and still work.
        let rel_root = relative_to(worktree.path(), &self.cfg.root);
        let gitdir_ref = format!(
            "gitdir: {}\n",
            rel_root.join(".git/worktrees").join(&hash).display()
        );
        fs::write(worktree.path().join(".git").as_path(), gitdir_ref)
            .wrap_err("can't rewrite worktree .git file")?;

        self.configure_sparse_checkout(deadline, worktree, &hash)
            .await?;

        // This is the step that actually puts files on disk.
        info!(hash, "setting worktree HEAD");
        self.git(deadline, worktree.path(), &["reset", "--hard", &hash, "--"])
            .await
            .wrap_err("git reset failed in worktree")?;

        if self.cfg.submodules != SubmodulesMode::Off {
            info!("updating submodules");
            let depth_str;
            let mut args = vec!["submodule", "update", "--init"];
            if self.cfg.submodules == SubmodulesMode::Recursive {
                args.push("--recursive");
            }
            if self.cfg.depth > 0 {
                depth_str = self.cfg.depth.to_string();
                args.push("--depth");
                args.push(&depth_str);
            }
            self.git(deadline, worktree.path(), &args)
                .await
                .wrap_err("git submodule update failed")?;
        }

        Ok(())
    }

    async fn configure_sparse_checkout(
        &self,
        deadline: Deadline,
        worktree: &Worktree,
        hash: &str,
    ) -> Result<()> {
        let info_dir = self
            .cfg
            .root
            .join(".git/worktrees")
            .join(hash)
            .join("info");
        let sparse_config = info_dir.join("sparse-checkout");

        let Some(source) = &self.cfg.sparse_checkout_file else {
            // Not configured: make sure no stale sparse filter survives.
            if sparse_config.exists() {
                fs::remove_file(sparse_config.as_path())
                    .wrap_err("can't remove stale sparse-checkout config")?;
            }
            return Ok(());
        };

        info!(file = %source.display(), "configuring worktree sparse checkout");
        mkdir_all(info_dir.as_path())?;
        fs::copy(source, sparse_config.as_path()).with_context(|| {
            format!("can't install sparse-checkout file {}", source.display())
        })?;

        // `sparse-checkout init` must run after the file is in place for git
        // to honor it on the subsequent checkout.
        self.git(deadline, worktree.path(), &["sparse-checkout", "init"])
            .await
            .wrap_err("git sparse-checkout init failed")?;
        Ok(())
    }

    /// Check that the worktree is non-empty, synced to the expected hash,
    /// and internally consistent.
    ///
    /// git can die halfway through a checkout and still leave a directory
    /// that looks plausible, hence the HEAD comparison.
    pub async fn sanity_check(&self, deadline: Deadline, worktree: &Worktree) -> bool {
        debug!(%worktree, "sanity-checking worktree");

        match dir_is_empty(worktree.path()) {
            Err(err) => {
                warn!(path = %worktree, error = %err, "can't list worktree directory");
                return false;
            }
            Ok(true) => {
                warn!(path = %worktree, "worktree is empty");
                return false;
            }
            Ok(false) => {}
        }

        match self
            .git(deadline, worktree.path(), &["rev-parse", "HEAD"])
            .await
        {
            Err(err) => {
                warn!(path = %worktree, error = %err, "can't get worktree HEAD");
                return false;
            }
            Ok(head) => {
                if head != worktree.hash() {
                    warn!(path = %worktree, %head, "worktree HEAD does not match its hash");
                    return false;
                }
            }
        }

        if let Err(err) = self
            .git(
                deadline,
                worktree.path(),
                &["fsck", "--no-progress", "--connectivity-only"],
            )
            .await
        {
            warn!(path = %worktree, error = %err, "worktree fsck failed");
            return false;
        }

        true
    }

    /// Remove a worktree directory and let git forget about it.
    pub async fn remove(&self, deadline: Deadline, worktree: &Worktree) -> Result<()> {
        match fs::metadata(worktree.path().as_path()) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("can't stat worktree {worktree}"))
            }
            Ok(_) => {}
        }

        info!(path = %worktree, "removing worktree");
        fs::remove_dir_all(worktree.path().as_path())
            .with_context(|| format!("can't remove worktree directory {worktree}"))?;
        self.git(deadline, &self.cfg.root, &["worktree", "prune", "--verbose"])
            .await
            .wrap_err("git worktree prune failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcMode;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(root: &TempDir) -> Arc<RepoConfig> {
        let base = AbsPath::canonical(root.path()).unwrap();
        Arc::new(RepoConfig {
            git_cmd: "git".to_string(),
            repo: "https://example.com/repo.git".to_string(),
            ref_name: "HEAD".to_string(),
            depth: 0,
            submodules: SubmodulesMode::Off,
            gc: GcMode::Off,
            root: base.join("repo"),
            link: base.join("current"),
            sparse_checkout_file: None,
            stale_worktree_timeout: Duration::ZERO,
        })
    }

    #[test]
    fn test_worktree_hash_is_basename() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let manager = WorktreeManager::new(cfg.clone(), CommandRunner::new());

        let hash = "0123456789abcdef0123456789abcdef01234567";
        let wt = manager.worktree_for(hash);
        assert_eq!(wt.hash(), hash);
        assert_eq!(wt.path(), &cfg.worktrees_dir().join(hash));
    }

    #[tokio::test]
    async fn test_remove_missing_worktree_is_ok() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let manager = WorktreeManager::new(cfg, CommandRunner::new());

        let wt = manager.worktree_for(&"c".repeat(40));
        manager.remove(Deadline::unlimited(), &wt).await.unwrap();
    }

    #[tokio::test]
    async fn test_sanity_check_rejects_missing_and_empty() {
        let temp = TempDir::new().unwrap();
        let cfg = config(&temp);
        let manager = WorktreeManager::new(cfg, CommandRunner::new());

        let wt = manager.worktree_for(&"d".repeat(40));
        assert!(!manager.sanity_check(Deadline::unlimited(), &wt).await);

        mkdir_all(wt.path().as_path()).unwrap();
        assert!(!manager.sanity_check(Deadline::unlimited(), &wt).await);
    }
}

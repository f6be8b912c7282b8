//! The bare repository: initialization, fetching, resolution, maintenance.
//!
//! The store directory at `<root>` is opaque to consumers. It is validated
//! on every pass and wiped-and-reinitialized if a previous run left it
//! unusable; only its contents are removed, never the directory itself,
//! because it is commonly a mount point.

use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use eyre::{bail, eyre, Context, Result};
use tracing::{debug, info, warn};

use crate::config::{GcMode, KeyVal, RepoConfig, redact_url};
use crate::paths::{dir_is_empty, mkdir_all, remove_dir_contents, remove_dir_contents_if};
use crate::runner::{CommandRunner, Deadline, RunnerError};

/// Lock files that a crashed git invocation can leave behind.
const GIT_LOCK_FILES: &[&str] = &["shallow.lock"];

/// Drives the bare repository through the external git binary.
pub struct RepoStore {
    cfg: Arc<RepoConfig>,
    runner: CommandRunner,
}

impl RepoStore {
    pub fn new(cfg: Arc<RepoConfig>, runner: CommandRunner) -> Self {
        Self { cfg, runner }
    }

    /// Run git with the given args in the root directory.
    async fn git(&self, deadline: Deadline, args: &[&str]) -> Result<String, RunnerError> {
        let out = self
            .runner
            .run(deadline, Some(&self.cfg.root), &self.cfg.git_cmd, args)
            .await?;
        Ok(out.stdout)
    }

    /// Run git with no fixed working directory (global configuration).
    async fn git_global(&self, deadline: Deadline, args: &[&str]) -> Result<String, RunnerError> {
        let out = self
            .runner
            .run(deadline, None, &self.cfg.git_cmd, args)
            .await?;
        Ok(out.stdout)
    }

    /// The version string of the git binary; fails if it can't be run.
    pub async fn git_version(&self, deadline: Deadline) -> Result<String> {
        let version = self
            .git_global(deadline, &["version"])
            .await
            .wrap_err("can't run the git binary")?;
        Ok(version)
    }

    /// Examine the root and (re)initialize it if needed.
    ///
    /// After this returns, the root holds a valid (possibly empty) repository
    /// with a remote named `origin` pointing at the configured URL.
    pub async fn init(&self, deadline: Deadline) -> Result<()> {
        let mut needs_init = false;

        match fs::metadata(self.cfg.root.as_path()) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.cfg.root, "repo directory does not exist, creating it");
                mkdir_all(self.cfg.root.as_path())?;
                needs_init = true;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("can't stat root {}", self.cfg.root))
            }
            Ok(_) => {
                if self.sanity_check(deadline).await {
                    debug!(path = %self.cfg.root, "repo directory is valid");
                } else {
                    // A previous run may have crashed mid-operation. Remove
                    // the contents rather than the directory itself, which
                    // may be a volume mount.
                    info!(path = %self.cfg.root, "repo directory was empty or failed checks, wiping");
                    remove_dir_contents(&self.cfg.root)
                        .wrap_err("can't wipe unusable root directory")?;
                    needs_init = true;
                }
            }
        }

        if needs_init {
            // git init in an existing repo is documented as safe.
            info!(path = %self.cfg.root, "initializing repo directory");
            self.git(deadline, &["init", "-b", "git-sync"])
                .await
                .wrap_err("git init failed")?;
            if !self.sanity_check(deadline).await {
                bail!("can't initialize git repo directory");
            }
        }

        // The "origin" remote has special meaning, e.g. for relative-path
        // submodules, so make sure it exists and points at the right URL.
        match self.git(deadline, &["remote", "get-url", "origin"]).await {
            Ok(url) => {
                if url != self.cfg.repo {
                    self.git(deadline, &["remote", "set-url", "origin", &self.cfg.repo])
                        .await
                        .wrap_err("can't update origin URL")?;
                }
            }
            Err(RunnerError::Exit { stderr, .. }) if stderr.contains("No such remote") => {
                self.git(deadline, &["remote", "add", "origin", &self.cfg.repo])
                    .await
                    .wrap_err("can't add origin remote")?;
            }
            Err(err) => return Err(err).wrap_err("can't query origin remote"),
        }

        Ok(())
    }

    /// Structural checks on the root: non-empty, really the repo toplevel,
    /// passes fsck, and free of leftover lock files.
    pub async fn sanity_check(&self, deadline: Deadline) -> bool {
        debug!(path = %self.cfg.root, "sanity-checking git repo");

        match dir_is_empty(&self.cfg.root) {
            Err(err) => {
                warn!(path = %self.cfg.root, error = %err, "can't list repo directory");
                return false;
            }
            Ok(true) => {
                debug!(path = %self.cfg.root, "repo directory is empty");
                return false;
            }
            Ok(false) => {}
        }

        match self.git(deadline, &["rev-parse", "--show-toplevel"]).await {
            Err(err) => {
                warn!(path = %self.cfg.root, error = %err, "can't get repo toplevel");
                return false;
            }
            Ok(toplevel) => {
                if toplevel != self.cfg.root.to_string() {
                    warn!(path = %self.cfg.root, parent = %toplevel, "repo directory is under another repo");
                    return false;
                }
            }
        }

        // No --verbose: fsck output can be enormous.
        if let Err(err) = self
            .git(deadline, &["fsck", "--no-progress", "--connectivity-only"])
            .await
        {
            warn!(path = %self.cfg.root, error = %err, "repo fsck failed");
            return false;
        }

        // A crashed git invocation can leave an unreleased lock behind.
        for &lock in GIT_LOCK_FILES {
            let path = self.cfg.root.join(".git").join(lock);
            if path.exists() {
                warn!(path = %path, "repo contains lock file");
                return false;
            }
        }

        true
    }

    /// Fetch the configured ref from origin.
    ///
    /// Depth is applied at fetch time; a previously-shallow store is
    /// unshallowed when depth is no longer requested.
    pub async fn fetch(&self, deadline: Deadline) -> Result<()> {
        debug!(ref_name = %self.cfg.ref_name, repo = %redact_url(&self.cfg.repo), "fetching");

        let depth_str;
        let mut args = vec![
            "fetch",
            "origin",
            self.cfg.ref_name.as_str(),
            "--verbose",
            "--no-progress",
            "--prune",
            "--no-auto-gc",
        ];
        if self.cfg.depth > 0 {
            depth_str = self.cfg.depth.to_string();
            args.push("--depth");
            args.push(&depth_str);
        } else if self.is_shallow(deadline).await? {
            args.push("--unshallow");
        }

        self.git(deadline, &args).await.wrap_err("git fetch failed")?;
        Ok(())
    }

    async fn is_shallow(&self, deadline: Deadline) -> Result<bool> {
        let out = self
            .git(deadline, &["rev-parse", "--is-shallow-repository"])
            .await
            .wrap_err("can't determine repo shallowness")?;
        match out.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => bail!("unparseable bool: {other:?}"),
        }
    }

    /// The commit hash the last fetch landed on.
    ///
    /// The `^{}` peel resolves annotated tags to their underlying commit and
    /// is a no-op for branches, plain tags, and hashes.
    pub async fn resolve_fetch_head(&self, deadline: Deadline) -> Result<String> {
        let hash = self
            .git(deadline, &["rev-parse", "FETCH_HEAD^{}"])
            .await
            .wrap_err("can't resolve FETCH_HEAD")?;
        Ok(hash.trim().to_string())
    }

    /// Point the bare repo's HEAD at `hash` without touching any files.
    ///
    /// This keeps subsequent fetches cheap.
    pub async fn reset_soft(&self, deadline: Deadline, hash: &str) -> Result<()> {
        self.git(deadline, &["reset", "--soft", hash, "--"])
            .await
            .wrap_err("git reset failed")?;
        Ok(())
    }

    /// Feed a credential into the tool's credential store.
    pub async fn store_credentials(
        &self,
        deadline: Deadline,
        url: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        debug!(url = %redact_url(url), "storing git credential");
        let stdin = format!("url={url}\nusername={username}\npassword={password}\n");
        self.runner
            .run_with_stdin(
                deadline,
                None,
                &stdin,
                &self.cfg.git_cmd,
                &["credential", "approve"],
            )
            .await
            .wrap_err("can't configure git credentials")?;
        Ok(())
    }

    /// Set one global git config value.
    pub async fn set_global_config(&self, deadline: Deadline, key: &str, val: &str) -> Result<()> {
        self.git_global(deadline, &["config", "--global", key, val])
            .await
            .map_err(|err| eyre!("error configuring git {key:?} {val:?}: {err}"))?;
        Ok(())
    }

    /// Apply the default global configs the engine depends on.
    pub async fn setup_default_configs(&self, deadline: Deadline) -> Result<()> {
        const DEFAULTS: &[(&str, &str)] = &[
            // Never auto-detach GC runs.
            ("gc.autoDetach", "false"),
            // Fairly aggressive GC.
            ("gc.pruneExpire", "now"),
            // How to manage credentials (for those modes that need it).
            ("credential.helper", "cache --timeout 3600"),
            // Never prompt for a password.
            ("core.askPass", "true"),
            // Mark repos as safe (avoid a "dubious ownership" error).
            ("safe.directory", "*"),
        ];
        for (key, val) in DEFAULTS {
            self.set_global_config(deadline, key, val).await?;
        }
        Ok(())
    }

    /// Apply user-provided global config overrides.
    pub async fn setup_extra_configs(&self, deadline: Deadline, configs: &[KeyVal]) -> Result<()> {
        for kv in configs {
            debug!(key = %kv.key, "setting additional git config");
            self.set_global_config(deadline, &kv.key, &kv.val).await?;
        }
        Ok(())
    }

    /// Configure git to read cookies from `path`.
    pub async fn setup_cookie_file(&self, deadline: Deadline, path: &str) -> Result<()> {
        fs::metadata(path).with_context(|| format!("can't access git cookiefile {path}"))?;
        self.set_global_config(deadline, "http.cookiefile", path)
            .await
            .wrap_err("can't configure git cookiefile")?;
        Ok(())
    }

    /// Remove worktrees past the retention window and run git maintenance.
    ///
    /// If nothing was stale, the prune/expire/gc steps are skipped for this
    /// tick. Errors are collected so one failing step doesn't hide the rest.
    pub async fn cleanup(&self, deadline: Deadline, current_hash: &str) -> Result<()> {
        let worktrees_dir = self.cfg.worktrees_dir();
        if !worktrees_dir.exists() {
            return Ok(());
        }

        debug!(current_hash, "cleaning up stale worktrees");
        let mut removed = 0usize;
        let stale_timeout = self.cfg.stale_worktree_timeout;
        remove_dir_contents_if(&worktrees_dir, |name, meta| {
            if name == current_hash {
                return false;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            match age {
                Some(age) if age > stale_timeout => {
                    removed += 1;
                    true
                }
                _ => false,
            }
        })?;

        if removed == 0 {
            return Ok(());
        }
        info!(removed, "removed stale worktrees");

        let mut first_err: Option<eyre::Report> = None;
        let mut record = |step: &str, err: RunnerError| {
            warn!(step, error = %err, "cleanup step failed");
            if first_err.is_none() {
                first_err = Some(eyre!("{step} failed: {err}"));
            }
        };

        debug!("pruning worktrees");
        if let Err(err) = self.git(deadline, &["worktree", "prune", "--verbose"]).await {
            record("worktree prune", err);
        }

        debug!("expiring unreachable refs");
        if let Err(err) = self
            .git(
                deadline,
                &["reflog", "expire", "--expire-unreachable=all", "--all"],
            )
            .await
        {
            record("reflog expire", err);
        }

        if self.cfg.gc != GcMode::Off {
            let mut args = vec!["gc"];
            match self.cfg.gc {
                GcMode::Auto => args.push("--auto"),
                GcMode::Aggressive => args.push("--aggressive"),
                GcMode::Always | GcMode::Off => {}
            }
            debug!("running git garbage collection");
            if let Err(err) = self.git(deadline, &args).await {
                record("git gc", err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

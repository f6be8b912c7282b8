//! The sync loop: reconcile local state with the intended remote revision.
//!
//! One pass runs strictly in this order: refresh credentials, validate the
//! store, read the published link, fetch and resolve the remote, sanity-check
//! the current worktree, build and configure a new worktree if needed, flip
//! the symlink, fire hooks, run maintenance. Consumers never observe a
//! partially-built tree because the symlink flip is the only visible step.
//!
//! Any failure aborts the pass; partial filesystem state is fine because the
//! next pass re-converges (a missing worktree is rebuilt, a stale link is
//! republished).

use std::fs;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::auth::CredentialManager;
use crate::config::{redact_url, RepoConfig, SyncConfig};
use crate::hooks::HookHandle;
use crate::paths::touch;
use crate::publish::Publisher;
use crate::repo::{RepoStore, WorktreeManager};
use crate::runner::Deadline;

/// What one successful pass did.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The target moved, or the worktree layout had to change.
    pub changed: bool,
    /// The resolved remote hash.
    pub hash: String,
}

/// Drives sync passes until the process should exit.
pub struct SyncLoop {
    repo: Arc<RepoConfig>,
    cfg: SyncConfig,
    store: RepoStore,
    worktrees: WorktreeManager,
    publisher: Publisher,
    creds: CredentialManager,
    hooks: Vec<HookHandle>,
    sync_count: u64,
    fail_count: i32,
}

impl SyncLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<RepoConfig>,
        cfg: SyncConfig,
        store: RepoStore,
        worktrees: WorktreeManager,
        publisher: Publisher,
        creds: CredentialManager,
        hooks: Vec<HookHandle>,
    ) -> Self {
        Self {
            repo,
            cfg,
            store,
            worktrees,
            publisher,
            creds,
            hooks,
            sync_count: 0,
            fail_count: 0,
        }
    }

    /// Run until a terminal condition; the return value is the process exit
    /// code.
    pub async fn run(mut self) -> Result<i32> {
        let mut wake_signal = match self.cfg.sync_on_signal {
            Some(num) => Some(
                signal(SignalKind::from_raw(num))
                    .with_context(|| format!("can't install handler for signal {num}"))?,
            ),
            None => None,
        };

        loop {
            let deadline = Deadline::after(self.cfg.sync_timeout);

            match self.sync_pass(deadline).await {
                Err(err) => {
                    self.fail_count += 1;
                    self.export_error(&err);
                    if self.cfg.max_failures >= 0 && self.fail_count >= self.cfg.max_failures {
                        error!(fail_count = self.fail_count, error = ?err, "too many failures, aborting");
                        return Ok(1);
                    }
                    error!(fail_count = self.fail_count, error = ?err, "error syncing repo, will retry");
                }
                Ok(outcome) => {
                    // Might have been set on an earlier pass; harmless.
                    self.publisher.set_ready();
                    self.sync_count += 1;

                    // The first pass of a process counts as a sync even when
                    // nothing changed, so consumers hear about the hash.
                    if outcome.changed || self.sync_count == 1 {
                        if let Err(err) = self.publisher.touch_touch_file() {
                            error!(error = %err, "failed to touch touch-file");
                        }
                        // In before-symlink mode the hooks were already sent
                        // inside the pass.
                        if !self.cfg.hooks_before_symlink {
                            self.send_hooks(&outcome.hash).await;
                        }
                        info!(status = "success", hash = %outcome.hash, sync_count = self.sync_count, "synced");
                    } else {
                        debug!(status = "noop", sync_count = self.sync_count, "synced");
                    }

                    if let Err(err) = self.store.cleanup(deadline, &outcome.hash).await {
                        error!(error = %err, "git cleanup failed");
                    }

                    if self.cfg.one_time {
                        let code = self.one_time_exit_code().await;
                        self.delete_error_file();
                        info!(status = code, "exiting after one sync");
                        return Ok(code);
                    }

                    if outcome.hash == self.repo.ref_name {
                        info!(ref_name = %self.repo.ref_name, "ref appears to be a git hash, no further sync needed");
                        self.delete_error_file();
                        // Nothing left to poll for; idle until interrupted.
                        tokio::signal::ctrl_c()
                            .await
                            .wrap_err("can't wait for interrupt")?;
                        return Ok(0);
                    }

                    if self.fail_count > 0 {
                        debug!(fail_count = self.fail_count, "resetting failure count");
                        self.fail_count = 0;
                    }
                    self.delete_error_file();
                }
            }

            debug!(period = ?self.cfg.period, sync_count = self.sync_count, "next sync");
            match &mut wake_signal {
                Some(sig) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.period) => {}
                        _ = sig.recv() => info!("caught signal, syncing now"),
                    }
                }
                None => tokio::time::sleep(self.cfg.period).await,
            }
        }
    }

    /// One reconciliation pass. Does not fire post-symlink hooks or run
    /// maintenance; [`run`](Self::run) layers those on top.
    pub async fn sync_pass(&mut self, deadline: Deadline) -> Result<SyncOutcome> {
        debug!(repo = %redact_url(&self.repo.repo), "syncing");

        self.creds
            .refresh(deadline, &self.store)
            .await
            .wrap_err("credential refresh failed")?;

        self.store.init(deadline).await?;

        let current = self.publisher.read_current()?;
        let mut current_hash = current.as_ref().map(|w| w.hash()).unwrap_or_default();
        debug!(hash = %current_hash, "current state");

        // Cheap when we already have the target hash; parameters like depth
        // are applied here.
        self.store.fetch(deadline).await?;
        let remote_hash = self.store.resolve_fetch_head(deadline).await?;

        if current_hash == remote_hash {
            // Right hash already; make sure the tree behind it is intact.
            if let Some(worktree) = &current {
                if !self.worktrees.sanity_check(deadline, worktree).await {
                    warn!(path = %worktree, "worktree failed checks or was empty");
                    self.worktrees.remove(deadline, worktree).await?;
                    current_hash.clear();
                }
            }
        }

        // Also treat a worktree living outside the expected location as a
        // change, so layouts from older runs get migrated.
        let changed = current_hash != remote_hash
            || current
                .as_ref()
                .is_some_and(|w| w != &self.worktrees.worktree_for(&current_hash));

        if self.cfg.hooks_before_symlink {
            // The link still points at the previous worktree here; consumers
            // that must prepare before the switch rely on that.
            self.send_hooks(&remote_hash).await;
        }

        if changed || self.sync_count == 0 {
            info!(
                ref_name = %self.repo.ref_name,
                local = %current_hash,
                remote = %remote_hash,
                sync_count = self.sync_count,
                "update required"
            );

            // Point the bare repo at the new hash (no checkout) so later
            // fetches stay cheap.
            self.store.reset_soft(deadline, &remote_hash).await?;

            let new_worktree = if changed {
                self.worktrees.create(deadline, &remote_hash).await?
            } else {
                match &current {
                    Some(worktree) => worktree.clone(),
                    None => self.worktrees.worktree_for(&remote_hash),
                }
            };

            // Even a pre-existing worktree may carry outdated settings
            // (e.g. sparse checkout), so configuration is always re-applied.
            self.worktrees.configure(deadline, &new_worktree).await?;

            if changed {
                self.publisher.publish(&new_worktree)?;
                if let Some(old) = &current {
                    // Start the retention timer on the outgoing worktree.
                    if let Err(err) = touch(old.path()) {
                        error!(path = %old, error = %err, "can't change stale worktree mtime");
                    }
                }
            }

            info!(remote = %remote_hash, sync_count = self.sync_count, "updated successfully");

            // A worktree from an older layout won't be caught by normal
            // cleanup; drop it now that the link has moved off it.
            if !current_hash.is_empty() {
                if let Some(old) = &current {
                    if old != &self.worktrees.worktree_for(&current_hash) {
                        let _ = fs::remove_dir_all(old.path().as_path());
                    }
                }
            }
        } else {
            debug!(remote = %remote_hash, sync_count = self.sync_count, "update not required");
        }

        Ok(SyncOutcome {
            changed,
            hash: remote_hash,
        })
    }

    /// Deposit the hash into every configured hook runner.
    ///
    /// Failures here are the hook's problem, not the sync's: they are logged
    /// and retried by the runner, never propagated.
    async fn send_hooks(&self, hash: &str) {
        for hook in &self.hooks {
            if let Err(err) = hook.send(hash).await {
                error!(error = %err, "hook failed");
            }
        }
    }

    /// Exit status for one-shot mode: 0 only if every async hook delivered.
    async fn one_time_exit_code(&self) -> i32 {
        if !self.cfg.hooks_async {
            // Sync-mode hook failures already surfaced at send time.
            return 0;
        }
        let mut code = 0;
        for hook in &self.hooks {
            if !hook.wait_for_completion().await {
                code = 1;
            }
        }
        code
    }

    fn export_error(&self, err: &eyre::Report) {
        if let Some(path) = &self.cfg.error_file {
            if let Err(write_err) = fs::write(path.as_path(), format!("{err:#}\n")) {
                error!(path = %path, error = %write_err, "can't write error file");
            }
        }
    }

    fn delete_error_file(&self) {
        if let Some(path) = &self.cfg.error_file {
            match fs::remove_file(path.as_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => error!(path = %path, error = %err, "can't delete error file"),
            }
        }
    }
}

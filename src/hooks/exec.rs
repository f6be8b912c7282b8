//! The exec hook: run a command inside the published worktree.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Hook, HookError};
use crate::paths::AbsPath;
use crate::runner::{CommandRunner, Deadline};

/// Environment variable carrying the synced hash into the hook command.
pub const HASH_ENV: &str = "GITSYNC_HASH";

/// Runs the configured command with no arguments, with the worktree for the
/// notified hash as its working directory.
pub struct ExecHook {
    command: String,
    worktrees_dir: AbsPath,
    timeout: Duration,
    runner: CommandRunner,
}

impl ExecHook {
    pub fn new(
        command: String,
        worktrees_dir: AbsPath,
        timeout: Duration,
        runner: CommandRunner,
    ) -> Self {
        Self {
            command,
            worktrees_dir,
            timeout,
            runner,
        }
    }
}

#[async_trait]
impl Hook for ExecHook {
    fn name(&self) -> &str {
        "exechook"
    }

    async fn invoke(&self, hash: &str) -> Result<(), HookError> {
        let cwd = self.worktrees_dir.join(hash);
        debug!(command = %self.command, %cwd, "running exechook");
        self.runner
            .clone()
            .with_env(HASH_ENV, hash)
            .run(Deadline::after(self.timeout), Some(&cwd), &self.command, &[])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn worktree(temp: &TempDir, hash: &str) -> AbsPath {
        let dir = AbsPath::canonical(temp.path()).unwrap().join(".worktrees");
        fs::create_dir_all(dir.join(hash).as_path()).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_exec_hook_runs_in_worktree_with_hash_env() {
        let temp = TempDir::new().unwrap();
        let hash = "e".repeat(40);
        let dir = worktree(&temp, &hash);

        // The hook writes its cwd and env into a file we can inspect.
        let script = temp.path().join("hook.sh");
        fs::write(&script, "#!/bin/sh\necho \"$PWD $GITSYNC_HASH\" > out.txt\n").unwrap();
        fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();

        let hook = ExecHook::new(
            script.display().to_string(),
            dir.clone(),
            Duration::from_secs(10),
            CommandRunner::new(),
        );
        hook.invoke(&hash).await.unwrap();

        let out = fs::read_to_string(dir.join(&hash).join("out.txt").as_path()).unwrap();
        assert_eq!(out.trim(), format!("{} {}", dir.join(&hash), hash));
    }

    #[tokio::test]
    async fn test_exec_hook_nonzero_exit_is_error() {
        let temp = TempDir::new().unwrap();
        let hash = "f".repeat(40);
        let dir = worktree(&temp, &hash);

        let hook = ExecHook::new(
            "false".to_string(),
            dir,
            Duration::from_secs(10),
            CommandRunner::new(),
        );
        let err = hook.invoke(&hash).await.unwrap_err();
        assert!(matches!(err, HookError::Command(_)));
    }
}

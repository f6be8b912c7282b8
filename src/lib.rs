//! gitsyncd - mirror a remote git repository to a local directory.
//!
//! A long-running agent that fetches a remote repository on a cadence,
//! materializes each synced commit into its own worktree, and publishes the
//! result through a symlink that consumers can follow at any time.
//!
//! # Consumer contract
//!
//! - The published link either does not exist (before the first sync) or
//!   points at a complete checkout of exactly one commit.
//! - The basename of the link's target is the synced commit hash.
//! - Updates are atomic: a reader following the link mid-sync sees either
//!   the old tree or the new one, never a partial state.
//!
//! # Modules
//!
//! - [`runner`] - external command execution with deadlines
//! - [`paths`] - canonicalized absolute paths and fs helpers
//! - [`config`] - resolved configuration types
//! - [`cli`] - flag/env surface and validation
//! - [`auth`] - credential assembly and refresh
//! - [`repo`] - the bare repository store and its worktrees
//! - [`publish`] - the atomic symlink flip
//! - [`hooks`] - coalescing, retrying sync notifications
//! - [`sync`] - the reconciliation loop
//! - [`http`] - the liveness endpoint

pub mod auth;
pub mod cli;
pub mod config;
pub mod hooks;
pub mod http;
pub mod paths;
pub mod publish;
pub mod repo;
pub mod runner;
pub mod sync;

// Re-export commonly used types
pub use auth::CredentialManager;
pub use cli::{Cli, Settings};
pub use config::{
    AuthConfig, Credential, ExechookConfig, GcMode, GithubAppConfig, RepoConfig, SshConfig,
    SubmodulesMode, SyncConfig, WebhookConfig,
};
pub use hooks::{ExecHook, Hook, HookHandle, HookRunner, Webhook};
pub use paths::AbsPath;
pub use publish::Publisher;
pub use repo::{RepoStore, Worktree, WorktreeManager};
pub use runner::{CommandRunner, Deadline, RunnerError};
pub use sync::{SyncLoop, SyncOutcome};

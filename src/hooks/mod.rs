//! Hook notifications fired for each newly-published hash.
//!
//! Two hook kinds exist: an exec hook (a command run inside the published
//! worktree) and a webhook (an HTTP request). Each configured hook gets its
//! own [`HookRunner`] with a one-slot coalescing mailbox: a newly-arrived
//! hash replaces any hash still waiting, so under load hooks fire for the
//! most recently-known target and may skip intermediate ones. Delivery is
//! at-least-once; hooks must be idempotent.

mod exec;
mod runner;
mod webhook;

use async_trait::async_trait;

pub use exec::ExecHook;
pub use runner::{HookHandle, HookRunner};
pub use webhook::Webhook;

use crate::runner::RunnerError;

/// Why a hook invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook command failed: {0}")]
    Command(#[from] RunnerError),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {got}, want {want}")]
    Status { got: u16, want: u16 },
}

/// One way of telling the outside world about a hash.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver the notification once. Retrying is the runner's job.
    async fn invoke(&self, hash: &str) -> Result<(), HookError>;
}

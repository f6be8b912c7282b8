//! Per-hook delivery worker with a coalescing mailbox.
//!
//! Each configured hook gets one runner. Senders deposit hashes into a
//! single-slot mailbox where a new hash overwrites an undelivered one;
//! dropped intermediates are intentional, only the latest target matters.
//! The worker delivers serially and retries failed attempts after a backoff,
//! unless a newer hash has arrived in the meantime.

use std::sync::Arc;
use std::time::Duration;

use eyre::eyre;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info};

use super::Hook;

#[derive(Default)]
struct HookState {
    /// The latest undelivered hash. Overwritten, never queued.
    pending: Option<String>,
    /// The hash currently being attempted.
    in_flight: Option<String>,
    /// Attempts finished so far, success or not.
    attempts: u64,
    /// Outcome of the most recent finished attempt.
    last_ok: Option<bool>,
}

struct HookData {
    state: Mutex<HookState>,
    /// Wakes the worker when a hash is deposited. The stored permit covers
    /// deposits that land while the worker is mid-attempt.
    deposit: Notify,
    /// Broadcasts the attempt counter so completion waiters can't miss an
    /// attempt that finishes between their state check and their wait.
    finished: watch::Sender<u64>,
}

impl HookData {
    fn new() -> Self {
        Self {
            state: Mutex::new(HookState::default()),
            deposit: Notify::new(),
            finished: watch::channel(0).0,
        }
    }

    /// Block until a hash is pending, then claim it.
    async fn take_pending(&self) -> String {
        loop {
            let wakeup = self.deposit.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(hash) = state.pending.take() {
                    state.in_flight = Some(hash.clone());
                    return hash;
                }
            }
            wakeup.await;
        }
    }

    async fn finish_attempt(&self, ok: bool) {
        let mut state = self.state.lock().await;
        state.in_flight = None;
        state.attempts += 1;
        state.last_ok = Some(ok);
        let attempts = state.attempts;
        drop(state);
        self.finished.send_replace(attempts);
    }

    /// Schedule a retry of `hash` unless a newer hash took the slot.
    async fn requeue_unless_superseded(&self, hash: String) {
        let mut state = self.state.lock().await;
        if state.pending.is_none() {
            state.pending = Some(hash);
            self.deposit.notify_one();
        }
    }
}

/// Sender half: deposits hashes and waits for completion.
#[derive(Clone)]
pub struct HookHandle {
    name: String,
    data: Arc<HookData>,
    async_mode: bool,
}

impl HookHandle {
    /// Notify the hook of a new hash.
    ///
    /// In async mode this returns as soon as the hash is deposited. In sync
    /// mode it blocks until the attempt triggered by this deposit finishes
    /// and reports that attempt's outcome; retries continue in the
    /// background regardless.
    pub async fn send(&self, hash: &str) -> eyre::Result<()> {
        let seq = {
            let mut state = self.data.state.lock().await;
            state.pending = Some(hash.to_string());
            let seq = state.attempts;
            self.data.deposit.notify_one();
            seq
        };
        debug!(hook = %self.name, hash, "hook notified");

        if self.async_mode {
            return Ok(());
        }

        let mut finished = self.data.finished.subscribe();
        loop {
            {
                let state = self.data.state.lock().await;
                if state.attempts > seq && state.pending.is_none() && state.in_flight.is_none() {
                    return match state.last_ok {
                        Some(true) | None => Ok(()),
                        Some(false) => Err(eyre!("{} failed for hash {hash}", self.name)),
                    };
                }
            }
            let _ = finished.changed().await;
        }
    }

    /// Block until no attempt is pending or in flight, then report the
    /// outcome of the most recent attempt.
    ///
    /// During a retry backoff the mailbox is briefly idle, so a waiter that
    /// arrives then observes the failure; that is what lets a one-shot run
    /// exit nonzero instead of waiting out retries forever.
    pub async fn wait_for_completion(&self) -> bool {
        let mut finished = self.data.finished.subscribe();
        loop {
            {
                let state = self.data.state.lock().await;
                if state.pending.is_none() && state.in_flight.is_none() {
                    return state.last_ok.unwrap_or(true);
                }
            }
            let _ = finished.changed().await;
        }
    }
}

/// Worker half: owns the hook and delivers serially.
pub struct HookRunner {
    hook: Arc<dyn Hook>,
    backoff: Duration,
    data: Arc<HookData>,
}

impl HookRunner {
    /// Build a runner and its sender handle.
    pub fn new(hook: Arc<dyn Hook>, backoff: Duration, async_mode: bool) -> (Self, HookHandle) {
        let data = Arc::new(HookData::new());
        let handle = HookHandle {
            name: hook.name().to_string(),
            data: data.clone(),
            async_mode,
        };
        (
            Self {
                hook,
                backoff,
                data,
            },
            handle,
        )
    }

    /// Deliver forever. Spawn this on its own task.
    pub async fn run(self) {
        info!(hook = %self.hook.name(), "hook runner started");
        loop {
            let hash = self.data.take_pending().await;
            debug!(hook = %self.hook.name(), %hash, "running hook");

            let result = self.hook.invoke(&hash).await;
            let ok = result.is_ok();
            if let Err(err) = result {
                error!(hook = %self.hook.name(), %hash, error = %err, "hook failed, will retry");
            }
            self.data.finish_attempt(ok).await;

            if !ok {
                tokio::time::sleep(self.backoff).await;
                self.data.requeue_unless_superseded(hash).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records invocations and fails a configurable number of times first.
    struct MockHook {
        calls: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    impl MockHook {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
            })
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl Hook for MockHook {
        fn name(&self) -> &str {
            "mock"
        }

        async fn invoke(&self, hash: &str) -> Result<(), HookError> {
            self.calls.lock().await.push(hash.to_string());
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HookError::Status { got: 500, want: 200 });
            }
            Ok(())
        }
    }

    fn spawn(hook: Arc<MockHook>, backoff: Duration, async_mode: bool) -> HookHandle {
        let (runner, handle) = HookRunner::new(hook, backoff, async_mode);
        tokio::spawn(runner.run());
        handle
    }

    #[tokio::test]
    async fn test_async_send_delivers() {
        let hook = MockHook::new(0);
        let handle = spawn(hook.clone(), Duration::from_millis(10), true);

        handle.send("abc").await.unwrap();
        assert!(handle.wait_for_completion().await);
        assert_eq!(hook.calls().await, vec!["abc"]);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let hook = MockHook::new(3);
        let handle = spawn(hook.clone(), Duration::from_millis(5), true);

        handle.send("abc").await.unwrap();

        // Poll until the fourth (successful) attempt lands.
        for _ in 0..100 {
            if hook.calls().await.len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hook.calls().await, vec!["abc"; 4]);
        assert!(handle.wait_for_completion().await);
    }

    #[tokio::test]
    async fn test_completion_observes_failure_during_backoff() {
        let hook = MockHook::new(usize::MAX);
        let handle = spawn(hook.clone(), Duration::from_secs(60), true);

        handle.send("abc").await.unwrap();
        // The first attempt fails and the runner parks in its long backoff;
        // completion reports the failure instead of waiting it out.
        assert!(!handle.wait_for_completion().await);
    }

    #[tokio::test]
    async fn test_coalescing_drops_intermediate_hashes() {
        let hook = MockHook::new(1);
        let handle = spawn(hook.clone(), Duration::from_millis(300), true);

        // First send fails once; newer hashes arrive during the backoff and
        // overwrite each other in the slot.
        handle.send("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send("skipped").await.unwrap();
        handle.send("latest").await.unwrap();

        for _ in 0..100 {
            let calls = hook.calls().await;
            if calls.last().map(String::as_str) == Some("latest") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let calls = hook.calls().await;
        assert!(!calls.contains(&"skipped".to_string()), "calls: {calls:?}");
        assert_eq!(calls.last().map(String::as_str), Some("latest"));
        assert!(handle.wait_for_completion().await);
    }

    #[tokio::test]
    async fn test_sync_send_blocks_and_reports_failure() {
        let hook = MockHook::new(1);
        let handle = spawn(hook.clone(), Duration::from_millis(300), false);

        // First attempt fails; this send reports it.
        assert!(handle.send("abc").await.is_err());
        assert_eq!(hook.calls().await, vec!["abc"]);

        // The background retry eventually succeeds.
        for _ in 0..100 {
            if handle.wait_for_completion().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.wait_for_completion().await);
    }

    #[tokio::test]
    async fn test_sync_send_success() {
        let hook = MockHook::new(0);
        let handle = spawn(hook.clone(), Duration::from_millis(5), false);

        handle.send("abc").await.unwrap();
        assert_eq!(hook.calls().await, vec!["abc"]);
    }
}

//! The webhook: notify an HTTP endpoint of each published hash.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tracing::debug;

use super::{Hook, HookError};

/// Header carrying the synced hash to the endpoint.
pub const HASH_HEADER: &str = "Gitsync-Hash";

/// Issues the configured HTTP method against the URL for each hash.
pub struct Webhook {
    url: String,
    method: Method,
    /// Expected response status; 0 disables the check (fire-and-forget).
    success_status: u16,
    timeout: Duration,
    client: reqwest::Client,
}

impl Webhook {
    pub fn new(url: String, method: Method, success_status: u16, timeout: Duration) -> Self {
        Self {
            url,
            method,
            success_status,
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Hook for Webhook {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn invoke(&self, hash: &str) -> Result<(), HookError> {
        debug!(url = %self.url, method = %self.method, "sending webhook");
        let resp = self
            .client
            .request(self.method.clone(), &self.url)
            .header(HASH_HEADER, hash)
            .timeout(self.timeout)
            .send()
            .await?;

        if self.success_status != 0 && resp.status().as_u16() != self.success_status {
            return Err(HookError::Status {
                got: resp.status().as_u16(),
                want: self.success_status,
            });
        }
        Ok(())
    }
}

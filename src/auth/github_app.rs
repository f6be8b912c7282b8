//! GitHub App authentication: mint short-lived installation tokens.
//!
//! A signed app assertion (RS256, 10 minute lifetime) is exchanged for an
//! installation access token. The token's own expiry is tracked so the
//! caller can refresh it shortly before it becomes unusable.

use std::fs;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AuthError;
use crate::config::GithubAppConfig;
use crate::runner::Deadline;

/// Refresh the token this long before its recorded expiry.
const EXPIRY_SLACK_SECS: i64 = 30;

/// Lifetime of the signed app assertion.
const ASSERTION_LIFETIME_SECS: i64 = 600;

#[derive(Serialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Holds the app settings and the expiry of the last minted token.
pub struct GithubAppAuth {
    config: GithubAppConfig,
    http: reqwest::Client,
    token_expiry: Option<DateTime<Utc>>,
}

impl GithubAppAuth {
    pub fn new(config: GithubAppConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token_expiry: None,
        }
    }

    /// True when no token has been minted yet or the current one expires
    /// within the slack window.
    pub fn token_due(&self) -> bool {
        match self.token_expiry {
            None => true,
            Some(expiry) => expiry <= Utc::now() + ChronoDuration::seconds(EXPIRY_SLACK_SECS),
        }
    }

    /// Mint a fresh installation token and record its expiry.
    pub async fn refresh_token(&mut self, deadline: Deadline) -> Result<String, AuthError> {
        let pem = match &self.config.private_key {
            Some(inline) => inline.clone(),
            None => {
                // Validation guarantees one of the two sources is set.
                let path = self.config.private_key_file.clone().unwrap_or_default();
                fs::read_to_string(&path)
                    .map_err(|source| AuthError::KeyFile { path, source })?
            }
        };
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())?;

        let now = Utc::now();
        let claims = Claims {
            iss: self.issuer(),
            iat: now.timestamp(),
            exp: (now + ChronoDuration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.config.base_url.trim_end_matches('/'),
            self.config.installation_id
        );
        debug!(%url, "requesting installation token");

        let mut req = self
            .http
            .post(&url)
            .bearer_auth(assertion)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(left) = deadline.remaining() {
            req = req.timeout(left);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        debug!(expires_at = %token.expires_at, "received installation token");
        self.token_expiry = Some(token.expires_at);
        Ok(token.token)
    }

    /// Either the client ID or the numeric application ID can issue JWTs.
    fn issuer(&self) -> String {
        match &self.config.client_id {
            Some(id) => id.clone(),
            None => self.config.application_id.unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GithubAppConfig {
        GithubAppConfig {
            base_url: "https://api.github.com/".to_string(),
            private_key: None,
            private_key_file: None,
            client_id: None,
            application_id: Some(12345),
            installation_id: 678,
        }
    }

    #[test]
    fn test_token_due_before_first_mint() {
        let auth = GithubAppAuth::new(config());
        assert!(auth.token_due());
    }

    #[test]
    fn test_token_due_near_expiry() {
        let mut auth = GithubAppAuth::new(config());

        auth.token_expiry = Some(Utc::now() + ChronoDuration::seconds(10));
        assert!(auth.token_due(), "within the slack window");

        auth.token_expiry = Some(Utc::now() + ChronoDuration::minutes(30));
        assert!(!auth.token_due(), "plenty of lifetime left");
    }

    #[test]
    fn test_issuer_prefers_client_id() {
        let mut cfg = config();
        cfg.client_id = Some("Iv1.abcdef".to_string());
        let auth = GithubAppAuth::new(cfg);
        assert_eq!(auth.issuer(), "Iv1.abcdef");

        let auth = GithubAppAuth::new(config());
        assert_eq!(auth.issuer(), "12345");
    }

    #[test]
    fn test_token_response_parses_rfc3339() {
        let token: TokenResponse = serde_json::from_str(
            r#"{"token":"ghs_abc","expires_at":"2026-08-02T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(token.token, "ghs_abc");
        assert_eq!(token.expires_at.timestamp(), 1785672000);
    }
}

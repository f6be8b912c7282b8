//! Credential lifecycle: assemble, refresh, and install credentials so the
//! git binary can authenticate without ever prompting.
//!
//! Three sources feed the tool's credential store on each sync, in order:
//! the static `--credential` list, the askpass URL (if configured), and the
//! GitHub App installation token (when its expiry is near). SSH and cookie
//! files are one-time environment/config setup done at startup.

mod askpass;
mod github_app;

use std::fs;
use std::path::PathBuf;

use eyre::{Context, Result};
use tracing::{debug, info};

pub use github_app::GithubAppAuth;

use crate::config::{AuthConfig, Credential, SshConfig, redact_url};
use crate::repo::RepoStore;
use crate::runner::Deadline;

/// Why a credential source failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential endpoint returned status {status}: {body:?}")]
    Status { status: u16, body: String },

    #[error("can't read key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't sign app assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Owns every dynamic credential source and re-installs them each sync.
///
/// Written to by the sync loop only; hook runners never touch credentials.
pub struct CredentialManager {
    config: AuthConfig,
    repo_url: String,
    github_app: Option<GithubAppAuth>,
}

impl CredentialManager {
    pub fn new(config: AuthConfig, repo_url: &str) -> Self {
        let github_app = config.github_app.clone().map(GithubAppAuth::new);
        Self {
            config,
            repo_url: repo_url.to_string(),
            github_app,
        }
    }

    /// Push every configured credential into the tool's credential store.
    ///
    /// Each installation is independent; the first failure fails the whole
    /// refresh and with it the sync pass.
    pub async fn refresh(&mut self, deadline: Deadline, store: &RepoStore) -> Result<()> {
        for cred in &self.config.credentials {
            let password = cred.password.as_deref().unwrap_or_default();
            store
                .store_credentials(deadline, &cred.url, &cred.username, password)
                .await?;
        }

        if let Some(url) = &self.config.askpass_url {
            // Dynamic credentials: re-fetched on every sync, never cached.
            debug!(url = %redact_url(url), "querying askpass URL");
            let (username, password) = askpass::fetch_credentials(url).await?;
            store
                .store_credentials(deadline, &self.repo_url, &username, &password)
                .await?;
        }

        if let Some(app) = &mut self.github_app {
            if app.token_due() {
                info!("refreshing GitHub app token");
                let token = app.refresh_token(deadline).await?;
                // GitHub only requires the username to be non-empty.
                store
                    .store_credentials(deadline, &self.repo_url, "-", &token)
                    .await?;
            }
        }

        Ok(())
    }
}

/// Load `password-file` contents into each credential that references one.
pub fn resolve_password_files(credentials: &mut [Credential]) -> Result<()> {
    for cred in credentials {
        if let Some(file) = &cred.password_file {
            let password = fs::read_to_string(file)
                .with_context(|| format!("can't read password file {}", file.display()))?;
            cred.password = Some(password);
        }
    }
    Ok(())
}

/// Compose the `GIT_SSH_COMMAND` value for the configured keys and
/// known-hosts policy.
///
/// Key files are not checked for existence here: SSH may never be used for
/// this remote, in which case missing files are fine.
pub fn ssh_command(ssh: &SshConfig) -> String {
    let mut cmd = std::env::var("GIT_SSH_COMMAND").unwrap_or_else(|_| "ssh".to_string());

    // Surface more from ssh itself as our own logging gets more verbose.
    if tracing::enabled!(tracing::Level::TRACE) {
        cmd.push_str(" -vv");
    } else if tracing::enabled!(tracing::Level::DEBUG) {
        cmd.push_str(" -v");
    }

    for key in &ssh.key_files {
        cmd.push_str(&format!(" -i {}", key.display()));
    }

    if ssh.known_hosts {
        cmd.push_str(&format!(
            " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            ssh.known_hosts_file.display()
        ));
    } else {
        cmd.push_str(" -o StrictHostKeyChecking=no");
    }

    cmd
}

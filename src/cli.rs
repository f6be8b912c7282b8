//! Command-line and environment flag surface.
//!
//! Every flag has a `GITSYNC_*` environment twin. Flags are preferred: a
//! misspelled flag is a fatal error while a misspelled environment variable
//! is silently ignored. Validation turns the raw flags into the resolved
//! [`Settings`]; errors name the offending flag and are terminal.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, eyre, Context, Result};
use tracing::info;

use crate::config::{
    AuthConfig, Credential, ExechookConfig, GcMode, GithubAppConfig, KeyVal, RepoConfig,
    SshConfig, SubmodulesMode, SyncConfig, WebhookConfig, parse_git_configs,
};
use crate::paths::{make_absolute, mkdir_all, AbsPath};

/// Sync a remote git repository to a local directory, continuously.
#[derive(Parser, Debug)]
#[command(name = "gitsyncd", version, about)]
pub struct Cli {
    /// The git repository to sync
    #[arg(long, env = "GITSYNC_REPO")]
    pub repo: String,

    /// The git revision (branch, tag, or hash) to sync
    #[arg(long = "ref", env = "GITSYNC_REF", default_value = "HEAD")]
    pub ref_name: String,

    /// Shallow-clone depth; 0 syncs the full history
    #[arg(long, env = "GITSYNC_DEPTH", default_value_t = 1)]
    pub depth: u32,

    /// Git submodule behavior
    #[arg(long, env = "GITSYNC_SUBMODULES", value_enum, default_value = "recursive")]
    pub submodules: SubmodulesMode,

    /// Path to a git sparse-checkout file
    #[arg(long, env = "GITSYNC_SPARSE_CHECKOUT_FILE")]
    pub sparse_checkout_file: Option<PathBuf>,

    /// The root directory for sync operations
    #[arg(long, env = "GITSYNC_ROOT")]
    pub root: PathBuf,

    /// The path (absolute or relative to --root) of the symlink to publish
    /// (defaults to the leaf dir of --repo)
    #[arg(long, env = "GITSYNC_LINK")]
    pub link: Option<String>,

    /// The path (absolute or relative to --root) of an optional file into
    /// which errors are written
    #[arg(long, env = "GITSYNC_ERROR_FILE")]
    pub error_file: Option<String>,

    /// How long to wait between syncs
    #[arg(long, env = "GITSYNC_PERIOD", value_parser = humantime::parse_duration, default_value = "10s")]
    pub period: Duration,

    /// The total time allowed for one complete sync
    #[arg(long, env = "GITSYNC_SYNC_TIMEOUT", value_parser = humantime::parse_duration, default_value = "120s")]
    pub sync_timeout: Duration,

    /// Exit after the first sync
    #[arg(long, env = "GITSYNC_ONE_TIME")]
    pub one_time: bool,

    /// Sync on receipt of the specified signal (name or number)
    #[arg(long, env = "GITSYNC_SYNC_ON_SIGNAL")]
    pub sync_on_signal: Option<String>,

    /// Consecutive failures allowed before aborting (-1 retries forever)
    #[arg(long, env = "GITSYNC_MAX_FAILURES", default_value_t = 0, allow_hyphen_values = true)]
    pub max_failures: i32,

    /// The path (absolute or relative to --root) of an optional file touched
    /// whenever a sync completes
    #[arg(long, env = "GITSYNC_TOUCH_FILE")]
    pub touch_file: Option<String>,

    /// Make all written data group-writable
    #[arg(long, env = "GITSYNC_GROUP_WRITE")]
    pub group_write: bool,

    /// How long to retain non-current worktrees
    #[arg(long, env = "GITSYNC_STALE_WORKTREE_TIMEOUT", value_parser = humantime::parse_duration, default_value = "0s")]
    pub stale_worktree_timeout: Duration,

    /// An optional command to run when syncs complete (must be idempotent)
    #[arg(long, env = "GITSYNC_EXECHOOK_COMMAND")]
    pub exechook_command: Option<String>,

    /// The timeout for the exechook
    #[arg(long, env = "GITSYNC_EXECHOOK_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub exechook_timeout: Duration,

    /// The time to wait before retrying a failed exechook
    #[arg(long, env = "GITSYNC_EXECHOOK_BACKOFF", value_parser = humantime::parse_duration, default_value = "3s")]
    pub exechook_backoff: Duration,

    /// A URL notified when syncs complete (must be idempotent)
    #[arg(long, env = "GITSYNC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// The HTTP method for the webhook
    #[arg(long, env = "GITSYNC_WEBHOOK_METHOD", default_value = "POST")]
    pub webhook_method: String,

    /// The HTTP status indicating webhook success (0 disables the check)
    #[arg(long, env = "GITSYNC_WEBHOOK_SUCCESS_STATUS", default_value_t = 200)]
    pub webhook_success_status: u16,

    /// The timeout for the webhook
    #[arg(long, env = "GITSYNC_WEBHOOK_TIMEOUT", value_parser = humantime::parse_duration, default_value = "1s")]
    pub webhook_timeout: Duration,

    /// The time to wait before retrying a failed webhook
    #[arg(long, env = "GITSYNC_WEBHOOK_BACKOFF", value_parser = humantime::parse_duration, default_value = "3s")]
    pub webhook_backoff: Duration,

    /// Run hooks asynchronously
    #[arg(
        long,
        env = "GITSYNC_HOOKS_ASYNC",
        action = clap::ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub hooks_async: bool,

    /// Run hooks before updating the symlink
    #[arg(long, env = "GITSYNC_HOOKS_BEFORE_SYMLINK")]
    pub hooks_before_symlink: bool,

    /// The username for git authentication
    #[arg(long, env = "GITSYNC_USERNAME")]
    pub username: Option<String>,

    /// The password or access token for git authentication (prefer
    /// --password-file)
    #[arg(long, env = "GITSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// The file from which the git auth password will be read
    #[arg(long, env = "GITSYNC_PASSWORD_FILE")]
    pub password_file: Option<PathBuf>,

    /// One or more credentials as a JSON object or list (repeatable)
    #[arg(long = "credential", env = "GITSYNC_CREDENTIAL", action = clap::ArgAction::Append)]
    pub credential: Vec<String>,

    /// The SSH key(s) to use (repeatable; the env var splits on ':')
    #[arg(
        long = "ssh-key-file",
        env = "GITSYNC_SSH_KEY_FILE",
        action = clap::ArgAction::Append,
        value_delimiter = ':',
        default_value = "/etc/git-secret/ssh"
    )]
    pub ssh_key_file: Vec<PathBuf>,

    /// Enable SSH known_hosts verification
    #[arg(
        long,
        env = "GITSYNC_SSH_KNOWN_HOSTS",
        action = clap::ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub ssh_known_hosts: bool,

    /// The known_hosts file to use
    #[arg(long, env = "GITSYNC_SSH_KNOWN_HOSTS_FILE", default_value = "/etc/git-secret/known_hosts")]
    pub ssh_known_hosts_file: PathBuf,

    /// Use a git cookiefile at this path for authentication
    #[arg(long, env = "GITSYNC_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    /// A URL to query for git credentials (username= and password= lines)
    #[arg(long, env = "GITSYNC_ASKPASS_URL")]
    pub askpass_url: Option<String>,

    /// The GitHub base URL for GitHub app auth
    #[arg(long, env = "GITSYNC_GITHUB_BASE_URL", default_value = "https://api.github.com/")]
    pub github_base_url: String,

    /// The private key for GitHub app auth (prefer the file variant)
    #[arg(long, env = "GITSYNC_GITHUB_APP_PRIVATE_KEY", hide_env_values = true)]
    pub github_app_private_key: Option<String>,

    /// The file from which the GitHub app private key will be read
    #[arg(long, env = "GITSYNC_GITHUB_APP_PRIVATE_KEY_FILE")]
    pub github_app_private_key_file: Option<PathBuf>,

    /// The client ID of the GitHub app
    #[arg(long, env = "GITSYNC_GITHUB_APP_CLIENT_ID")]
    pub github_app_client_id: Option<String>,

    /// The application ID of the GitHub app
    #[arg(long, env = "GITSYNC_GITHUB_APP_APPLICATION_ID")]
    pub github_app_application_id: Option<u64>,

    /// The installation ID of the GitHub app
    #[arg(long, env = "GITSYNC_GITHUB_APP_INSTALLATION_ID")]
    pub github_app_installation_id: Option<u64>,

    /// The git command to run
    #[arg(long = "git", env = "GITSYNC_GIT", default_value = "git")]
    pub git_cmd: String,

    /// Additional git config options in 'key:val,...' format
    #[arg(long, env = "GITSYNC_GIT_CONFIG")]
    pub git_config: Option<String>,

    /// Git garbage collection behavior
    #[arg(long, env = "GITSYNC_GIT_GC", value_enum, default_value = "always")]
    pub git_gc: GcMode,

    /// The bind address (including port) for the HTTP liveness endpoint
    #[arg(long, env = "GITSYNC_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, env = "GITSYNC_VERBOSE", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The fully-validated runtime settings.
pub struct Settings {
    pub repo: RepoConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub ssh: SshConfig,
    pub cookie_file: Option<PathBuf>,
    pub git_config_extras: Vec<KeyVal>,
    pub exechook: Option<ExechookConfig>,
    pub webhook: Option<WebhookConfig>,
    pub touch_file: Option<AbsPath>,
    pub http_bind: Option<String>,
}

impl Cli {
    /// Validate the flags and resolve them into runtime settings.
    ///
    /// Creates and canonicalizes the root directory; call after the umask is
    /// in place.
    pub fn validate(mut self) -> Result<Settings> {
        if self.repo.is_empty() {
            bail!("required flag: --repo must be specified");
        }
        if self.ref_name.is_empty() {
            bail!("required flag: --ref must be specified");
        }
        if self.period < Duration::from_millis(10) {
            bail!("invalid flag: --period must be at least 10ms");
        }
        if self.sync_timeout < Duration::from_millis(10) {
            bail!("invalid flag: --sync-timeout must be at least 10ms");
        }
        if self.exechook_command.is_some() {
            if self.exechook_timeout < Duration::from_secs(1) {
                bail!("invalid flag: --exechook-timeout must be at least 1s");
            }
            if self.exechook_backoff < Duration::from_secs(1) {
                bail!("invalid flag: --exechook-backoff must be at least 1s");
            }
        }
        if self.webhook_url.is_some() {
            if self.webhook_timeout < Duration::from_secs(1) {
                bail!("invalid flag: --webhook-timeout must be at least 1s");
            }
            if self.webhook_backoff < Duration::from_secs(1) {
                bail!("invalid flag: --webhook-backoff must be at least 1s");
            }
        }

        // An HTTP(S) URL may carry user:pass; split it into a credential so
        // the URL itself stays clean.
        if self.username.is_none() {
            if let Ok(mut u) = url::Url::parse(&self.repo) {
                if matches!(u.scheme(), "http" | "https") && !u.username().is_empty() {
                    self.username = Some(u.username().to_string());
                    if let Some(pass) = u.password() {
                        self.password = Some(pass.to_string());
                    }
                    let _ = u.set_username("");
                    let _ = u.set_password(None);
                    self.repo = u.to_string();
                }
            }
        }

        if self.username.is_some() {
            if self.password.is_none() && self.password_file.is_none() {
                bail!("required flag: $GITSYNC_PASSWORD or --password-file must be specified when --username is specified");
            }
            if self.password.is_some() && self.password_file.is_some() {
                bail!("invalid flag: only one of $GITSYNC_PASSWORD and --password-file may be specified");
            }
            if let Ok(u) = url::Url::parse(&self.repo) {
                if !u.username().is_empty() {
                    bail!("invalid flag: credentials may not be specified in --repo when --username is specified");
                }
            }
        } else {
            if self.password.is_some() {
                bail!("invalid flag: $GITSYNC_PASSWORD may only be specified when --username is specified");
            }
            if self.password_file.is_some() {
                bail!("invalid flag: --password-file may only be specified when --username is specified");
            }
        }

        let github_app = self.validate_github_app()?;
        let credentials = self.assemble_credentials()?;

        let sync_on_signal = self
            .sync_on_signal
            .as_deref()
            .map(parse_signal)
            .transpose()?;

        let git_config_extras = match &self.git_config {
            Some(raw) => parse_git_configs(raw).wrap_err("can't parse --git-config flag")?,
            None => Vec::new(),
        };

        let webhook = match &self.webhook_url {
            Some(url) => Some(WebhookConfig {
                url: url.clone(),
                method: reqwest::Method::from_str(&self.webhook_method.to_uppercase())
                    .map_err(|_| eyre!("invalid flag: --webhook-method {:?}", self.webhook_method))?,
                success_status: self.webhook_success_status,
                timeout: self.webhook_timeout,
                backoff: self.webhook_backoff,
            }),
            None => None,
        };
        let exechook = self.exechook_command.as_ref().map(|command| ExechookConfig {
            command: command.clone(),
            timeout: self.exechook_timeout,
            backoff: self.exechook_backoff,
        });

        // The root must exist before it can be canonicalized; resolving
        // symlinks here keeps every later path comparison honest.
        mkdir_all(&self.root).wrap_err("can't make root dir")?;
        let root = AbsPath::canonical(&self.root).wrap_err("can't normalize root path")?;
        if root.as_path() != self.root {
            info!(requested = %self.root.display(), resolved = %root, "normalized root path");
        }

        let link_name = match self.link.as_deref() {
            Some(link) if !link.is_empty() => link.to_string(),
            _ => self
                .repo
                .trim_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let link = make_absolute(&link_name, &root)
            .ok_or_else(|| eyre!("required flag: --link must not be empty"))?;

        let touch_file = self
            .touch_file
            .as_deref()
            .and_then(|p| make_absolute(p, &root));
        let error_file = self
            .error_file
            .as_deref()
            .and_then(|p| make_absolute(p, &root));

        Ok(Settings {
            repo: RepoConfig {
                git_cmd: self.git_cmd,
                repo: self.repo,
                ref_name: self.ref_name,
                depth: self.depth,
                submodules: self.submodules,
                gc: self.git_gc,
                root,
                link,
                sparse_checkout_file: self.sparse_checkout_file,
                stale_worktree_timeout: self.stale_worktree_timeout,
            },
            sync: SyncConfig {
                period: self.period,
                sync_timeout: self.sync_timeout,
                one_time: self.one_time,
                max_failures: self.max_failures,
                sync_on_signal,
                error_file,
                hooks_async: self.hooks_async,
                hooks_before_symlink: self.hooks_before_symlink,
            },
            auth: AuthConfig {
                credentials,
                askpass_url: self.askpass_url,
                github_app,
            },
            ssh: SshConfig {
                key_files: self.ssh_key_file,
                known_hosts: self.ssh_known_hosts,
                known_hosts_file: self.ssh_known_hosts_file,
            },
            cookie_file: self.cookie_file,
            git_config_extras,
            exechook,
            webhook,
            touch_file,
            http_bind: self.http_bind,
        })
    }

    fn validate_github_app(&self) -> Result<Option<GithubAppConfig>> {
        let has_issuer =
            self.github_app_application_id.is_some() || self.github_app_client_id.is_some();

        if !has_issuer {
            if self.github_app_installation_id.is_some() {
                bail!("invalid flag: --github-app-installation-id may only be specified with --github-app-application-id or --github-app-client-id");
            }
            if self.github_app_private_key.is_some() || self.github_app_private_key_file.is_some()
            {
                bail!("invalid flag: a GitHub app private key may only be specified with --github-app-application-id or --github-app-client-id");
            }
            return Ok(None);
        }

        if self.github_app_application_id.is_some() && self.github_app_client_id.is_some() {
            bail!("invalid flag: only one of --github-app-application-id or --github-app-client-id may be specified");
        }
        let Some(installation_id) = self.github_app_installation_id else {
            bail!("invalid flag: --github-app-installation-id must be specified when GitHub app auth is used");
        };
        if self.github_app_private_key.is_none() && self.github_app_private_key_file.is_none() {
            bail!("invalid flag: $GITSYNC_GITHUB_APP_PRIVATE_KEY or --github-app-private-key-file must be specified when GitHub app auth is used");
        }
        if self.github_app_private_key.is_some() && self.github_app_private_key_file.is_some() {
            bail!("invalid flag: only one of $GITSYNC_GITHUB_APP_PRIVATE_KEY or --github-app-private-key-file may be specified");
        }
        if self.username.is_some() || self.password.is_some() || self.password_file.is_some() {
            bail!("invalid flag: username/password auth may not be combined with GitHub app auth");
        }

        Ok(Some(GithubAppConfig {
            base_url: self.github_base_url.clone(),
            private_key: self.github_app_private_key.clone(),
            private_key_file: self.github_app_private_key_file.clone(),
            client_id: self.github_app_client_id.clone(),
            application_id: self.github_app_application_id,
            installation_id,
        }))
    }

    /// Merge --username/--password(-file) and every --credential flag into
    /// one ordered list; the username credential goes first.
    fn assemble_credentials(&self) -> Result<Vec<Credential>> {
        let mut credentials = Vec::new();

        if let Some(username) = &self.username {
            credentials.push(Credential {
                url: self.repo.clone(),
                username: username.clone(),
                password: self.password.clone(),
                password_file: self.password_file.clone(),
            });
        }

        for raw in &self.credential {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if raw.starts_with('[') {
                let list: Vec<Credential> = serde_json::from_str(raw)
                    .wrap_err("invalid flag: --credential must be a JSON object or list")?;
                credentials.extend(list);
            } else {
                let cred: Credential = serde_json::from_str(raw)
                    .wrap_err("invalid flag: --credential must be a JSON object or list")?;
                credentials.push(cred);
            }
        }

        for cred in &credentials {
            if cred.url.is_empty() {
                bail!("invalid flag: --credential URL must be specified");
            }
            if cred.username.is_empty() {
                bail!("invalid flag: --credential username must be specified");
            }
            if cred.password.is_none() && cred.password_file.is_none() {
                bail!("invalid flag: --credential password or password-file must be specified");
            }
            if cred.password.is_some() && cred.password_file.is_some() {
                bail!("invalid flag: only one of --credential password and password-file may be specified");
            }
        }

        Ok(credentials)
    }
}

/// Parse a signal given as a number ("1"), a name ("SIGHUP"), or a short
/// name ("HUP").
fn parse_signal(value: &str) -> Result<i32> {
    if let Ok(num) = value.parse::<i32>() {
        if num > 0 {
            return Ok(num);
        }
        bail!("invalid flag: --sync-on-signal must be a valid signal name or number");
    }

    let mut name = value.to_uppercase();
    if !name.starts_with("SIG") {
        name = format!("SIG{name}");
    }
    let signal = nix::sys::signal::Signal::from_str(&name)
        .map_err(|_| eyre!("invalid flag: --sync-on-signal must be a valid signal name or number"))?;
    Ok(signal as i32)
}

//! gitsyncd - sync a remote git repository to a local directory.
//!
//! Binary entry point: parse flags, set the umask, wire up the store, hook
//! runners, and liveness endpoint, then hand control to the sync loop.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{error, info};

use gitsyncd::auth::{self, CredentialManager};
use gitsyncd::cli::{Cli, Settings};
use gitsyncd::hooks::{ExecHook, HookHandle, HookRunner, Webhook};
use gitsyncd::publish::Publisher;
use gitsyncd::repo::{RepoStore, WorktreeManager};
use gitsyncd::runner::{CommandRunner, Deadline};
use gitsyncd::sync::SyncLoop;
use gitsyncd::{config, http};

fn setup_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
    Ok(())
}

/// Point git at a private global config so the host's is never touched.
///
/// Returns the environment additions every child process needs.
fn private_gitconfig_env() -> Result<Vec<(String, String)>> {
    let path = std::env::temp_dir().join(format!("gitsyncd.gitconfig.{}", std::process::id()));
    fs::write(&path, "").with_context(|| format!("can't create gitconfig {}", path.display()))?;
    info!(path = %path.display(), "created private gitconfig file");
    Ok(vec![
        ("GIT_CONFIG_GLOBAL".to_string(), path.display().to_string()),
        ("GIT_CONFIG_NOSYSTEM".to_string(), "true".to_string()),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    // The umask shapes the mode of everything created below, so it goes
    // first. Group-writable data corresponds to git's "shared repository".
    let umask = if cli.group_write {
        nix::sys::stat::Mode::from_bits_truncate(0o002)
    } else {
        nix::sys::stat::Mode::from_bits_truncate(0o022)
    };
    nix::sys::stat::umask(umask);

    let settings = cli.validate()?;
    let code = run(settings).await?;
    std::process::exit(code);
}

async fn run(settings: Settings) -> Result<i32> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        repo = %config::redact_url(&settings.repo.repo),
        ref_name = %settings.repo.ref_name,
        root = %settings.repo.root,
        "starting up"
    );

    let mut runner = CommandRunner::new();
    for (key, val) in private_gitconfig_env()? {
        runner = runner.with_env(key, val);
    }
    runner = runner.with_env("GIT_SSH_COMMAND", auth::ssh_command(&settings.ssh));

    let repo_cfg = Arc::new(settings.repo);
    let store = RepoStore::new(repo_cfg.clone(), runner.clone());

    // Startup-only git configuration; no fetches happen here, so a modest
    // deadline is plenty.
    let startup = Deadline::after(Duration::from_secs(30));
    let git_version = store.git_version(startup).await?;
    info!(version = %git_version, "git version");
    store.setup_default_configs(startup).await?;
    if let Some(cookie_file) = &settings.cookie_file {
        store
            .setup_cookie_file(startup, &cookie_file.display().to_string())
            .await?;
    }
    // User overrides go last so they win over the defaults.
    store
        .setup_extra_configs(startup, &settings.git_config_extras)
        .await?;

    let mut auth_cfg = settings.auth;
    auth::resolve_password_files(&mut auth_cfg.credentials)?;
    let creds = CredentialManager::new(auth_cfg, &repo_cfg.repo);

    let worktrees = WorktreeManager::new(repo_cfg.clone(), runner.clone());
    let publisher = Publisher::new(repo_cfg.link.clone(), settings.touch_file.clone());

    if let Some(bind) = settings.http_bind.clone() {
        let ready = publisher.ready_flag();
        tokio::spawn(async move {
            if let Err(err) = http::serve(&bind, ready).await {
                error!(error = %err, "HTTP server terminated");
                std::process::exit(1);
            }
        });
    }

    let mut hooks: Vec<HookHandle> = Vec::new();
    if let Some(cfg) = &settings.exechook {
        let hook = Arc::new(ExecHook::new(
            cfg.command.clone(),
            repo_cfg.worktrees_dir(),
            cfg.timeout,
            runner.clone(),
        ));
        let (hook_runner, handle) = HookRunner::new(hook, cfg.backoff, settings.sync.hooks_async);
        tokio::spawn(hook_runner.run());
        hooks.push(handle);
    }
    if let Some(cfg) = &settings.webhook {
        let hook = Arc::new(Webhook::new(
            cfg.url.clone(),
            cfg.method.clone(),
            cfg.success_status,
            cfg.timeout,
        ));
        let (hook_runner, handle) = HookRunner::new(hook, cfg.backoff, settings.sync.hooks_async);
        tokio::spawn(hook_runner.run());
        hooks.push(handle);
    }

    SyncLoop::new(
        repo_cfg,
        settings.sync,
        store,
        worktrees,
        publisher,
        creds,
        hooks,
    )
    .run()
    .await
}

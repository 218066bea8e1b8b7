mod clock;
mod config;
mod context;
mod diagnostics;
mod environment;
mod git;
mod logging;
mod retry;
mod signals;
mod status;
mod streams;
mod supervisor;
mod workload;

use clap::Parser;
use config::SupervisorConfig;
use context::SupervisorContext;
use git::GitRepo;
use signals::SignalHandler;
use status::StatusTracker;
use std::path::PathBuf;
use supervisor::{Settings, Supervisor};
use workload::WorkloadSpec;

/// Keep a workload command running, restart it when it crashes, and
/// hot-update it whenever the tracked git branch advances.
#[derive(Parser, Debug)]
#[command(name = "hotpull", version, about)]
pub struct Cli {
    /// Git branch to monitor (default: from config, "main")
    #[arg(short, long)]
    branch: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "hotpull.toml")]
    config: PathBuf,

    /// Repository root (overrides config and the mount-path probe)
    #[arg(long)]
    repo_dir: Option<PathBuf>,

    /// Workload shell command (overrides config)
    #[arg(long)]
    command: Option<String>,

    /// Log directory (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (git commands, counter decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut SupervisorConfig) {
        if let Some(branch) = &self.branch {
            config.repository.branch = branch.clone();
        }
        if let Some(dir) = &self.repo_dir {
            config.repository.dir = Some(dir.clone());
        }
        if let Some(command) = &self.command {
            config.workload.command = command.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir = dir.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Variables from .env are inherited by git and the workload.
    let _ = dotenvy::dotenv();

    let mut config = SupervisorConfig::load(&cli.config)?;
    cli.apply(&mut config);

    let repo_root = environment::resolve_repo_root(&config.repository);
    let container = environment::detect_container(config.maintenance.container);
    let child_env =
        environment::child_env(container, &config.repository.mount_path, &config.environment);

    if cli.dry_run {
        println!("hotpull v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Repository: {}", repo_root.display());
        println!(
            "Tracking: {}/{}",
            config.repository.remote, config.repository.branch
        );
        println!("Workload: {}", config.workload.command);
        println!("Container mode: {container}");
        println!("Log file: {}", config.log_path().display());
        println!("{config:#?}");
        return Ok(());
    }

    let _log_guard = logging::init(
        &config.log_path(),
        config.logging.max_bytes,
        config.logging.backups,
        logging::Verbosity::from_flags(cli.verbose, cli.quiet),
    )?;

    tracing::info!(branch = %config.repository.branch, "monitoring branch");
    tracing::debug!(?cli, "parsed CLI arguments");

    if container {
        environment::prepare_container_dirs(&child_env);
    }

    let timing = config.timing();
    let repo = GitRepo::new(
        &repo_root,
        &config.repository.remote,
        &config.repository.branch,
        timing.git_timeout,
    )
    .with_env(child_env.clone())
    .with_stash_limit(config.maintenance.stash_limit);

    if repo.has_git_dir() {
        tracing::info!(root = %repo.root().display(), "git auto-update enabled");
    } else {
        tracing::warn!(root = %repo.root().display(), "git repository not found, auto-updates disabled");
    }

    let spec = WorkloadSpec {
        shell: config.workload.shell.clone(),
        command: config.workload.command.clone(),
        workdir: config.workload.workdir.clone(),
        env: child_env,
    };

    if let Some(parent) = config.logging.status_file.as_deref().and_then(|p| p.parent()) {
        let _ = std::fs::create_dir_all(parent);
    }
    let status = StatusTracker::new(config.logging.status_file.clone(), repo.branch(), repo.root());

    let ctx = SupervisorContext::new();
    let signals = SignalHandler::install(ctx.shutdown().clone())?;

    let settings = Settings {
        timing,
        diagnostics_every: config.maintenance.diagnostics_every,
        stash_cleanup_every: config.maintenance.stash_cleanup_every,
        container,
    };

    Supervisor::new(repo, spec, ctx, settings)
        .with_status(status)
        .run()
        .await;

    if signals.is_shutdown_requested() {
        tracing::info!("shut down on operator request");
    }
    Ok(())
}

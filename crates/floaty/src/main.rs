//! Floaty binary: Keepalived notification helper.

use clap::{CommandFactory, Parser};
use common::{Error, Result};
use floaty::notification::{Notification, VrrpState};
use floaty::providers::Provider;
use floaty::{config::NotifyConfig, fifo, lock, oom, process, refresh};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const ENV_VERBOSE: &str = "FLOATY_LOG_VERBOSE";
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    name = "floaty",
    version,
    about = "Keepalived notification helper binding elastic IP addresses to this node",
    override_usage = "floaty [OPTIONS] { -T <CONFIG> | <CONFIG> instance <NAME> <STATE> <PRIORITY> | --fifo <CONFIG> <PIPE> }"
)]
struct Cli {
    /// Verbose logging (environment variable: FLOATY_LOG_VERBOSE)
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log output in JSON format
    #[arg(long)]
    json_log: bool,

    /// Don't make calls to a cloud provider
    #[arg(long)]
    dry_run: bool,

    /// Test mode; verify configuration and API access
    #[arg(short = 'T', long = "test")]
    test_mode: bool,

    /// Read notifications from a named pipe
    #[arg(long)]
    fifo: bool,

    /// Configuration path followed by mode-specific arguments
    args: Vec<String>,
}

fn usage_and_exit() -> ! {
    let mut cmd = Cli::command();
    let _ = cmd.print_help();
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbose = cli.verbose
        || std::env::var(ENV_VERBOSE)
            .map(|value| !value.is_empty())
            .unwrap_or(false);
    common::logging::init(verbose, cli.json_log);

    if cli.args.is_empty() {
        usage_and_exit();
    }

    let root = CancellationToken::new();
    spawn_signal_handler(&root);

    if let Err(err) = run(cli, root).await {
        error!("{err}");
        std::process::exit(1);
    }
}

fn spawn_signal_handler(root: &CancellationToken) {
    let scope = root.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }

        scope.cancel();
    });
}

async fn run(cli: Cli, root: CancellationToken) -> Result<()> {
    process::spawn_keepalived_watcher(&root);
    oom::adjust_oom_score().await?;

    let config_path = cli.args[0].clone();
    let cfg = NotifyConfig::load(&config_path, cli.dry_run)?;

    if cli.test_mode {
        if cli.args.len() != 1 {
            usage_and_exit();
        }
        return run_self_test(&cfg).await;
    }

    if cli.fifo {
        if cli.args.len() != 2 {
            usage_and_exit();
        }
        return run_fifo(&cfg, &cli.args[1], &root).await;
    }

    if cli.args.len() != 5 {
        usage_and_exit();
    }
    run_notify(&cli, &cfg, &root).await
}

async fn run_self_test(cfg: &NotifyConfig) -> Result<()> {
    info!("Running self-test");

    let provider = cfg.new_provider().await?;

    tokio::time::timeout(SELF_TEST_TIMEOUT, provider.test())
        .await
        .map_err(|_| Error::provider("Self-test timed out"))?
}

async fn run_notify(cli: &Cli, cfg: &NotifyConfig, root: &CancellationToken) -> Result<()> {
    let notification =
        Notification::from_args(&cli.args[1], &cli.args[2], &cli.args[3], &cli.args[4])?;

    info!(
        config_file = %cli.args[0],
        instance = %notification.instance,
        state = %notification.state,
        version = env!("CARGO_PKG_VERSION"),
        "Handling notification"
    );

    let lock_path = cfg.make_lock_file_path(&notification.instance);
    let guard = lock::acquire_lock(root, &lock_path, cfg.lock_timeout).await?;

    let result = handle_oneshot(cfg, root, &notification).await;

    if let Err(err) = guard.release() {
        error!("Unlocking failed: {err}");
    }

    result
}

async fn handle_oneshot(
    cfg: &NotifyConfig,
    scope: &CancellationToken,
    notification: &Notification,
) -> Result<()> {
    let provider = cfg.new_provider().await?;

    let addresses = cfg.resolve_addresses(&notification.instance)?;
    info!(addresses = ?addresses, "IP addresses");

    if notification.state == VrrpState::Master {
        return refresh::pin_elastic_ips(scope, provider.as_ref(), &addresses, cfg).await;
    }

    // BACKUP and FAULT do nothing beyond the lock handover above
    Ok(())
}

async fn run_fifo(cfg: &NotifyConfig, pipe_path: &str, root: &CancellationToken) -> Result<()> {
    let provider: Arc<dyn Provider> = Arc::from(cfg.new_provider().await?);

    let (pipe, events, _watcher) = fifo::open_fifo(Path::new(pipe_path))?;

    let mut handler = fifo::FifoHandler::new(
        pipe,
        events,
        fifo::notification_handler(provider, Arc::new(cfg.clone())),
    );

    handler.handle_fifo(root).await
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use tokio::net::TcpListener;

use skiff::api;
use skiff::config::{AppConfig, expand_path};
use skiff::persistence::HttpRecordStore;
use skiff::sandbox::{LocalSandboxConfig, LocalSandboxProvider};
use skiff::session::{SessionRegistry, SessionServices};
use skiff::state::{StateStoreConfig, create_state_store};
use skiff::storage::RsyncStorage;
use skiff::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Skiff - session actors for sandboxed coding agents.",
    propagate_version = true
)]
struct Cli {
    /// Config file (default: the platform config dir, `skiff/config.toml`)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the session server
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Record store base URL (overrides record_store.base_url)
    #[arg(long, value_name = "URL")]
    record_store_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("unable to determine config directory"))?
            .join("skiff")
            .join("config.toml"),
    };
    let config = AppConfig::load(&config_file)
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    match cli.command {
        Command::Config => {
            print!(
                "{}",
                toml::to_string_pretty(&config).context("serializing config")?
            );
            Ok(())
        }
        Command::Serve(args) => {
            init_logging(&config, cli.verbose, cli.quiet);
            info!("Config: {}", config_file.display());
            serve(config, args).await
        }
    }
}

/// `RUST_LOG` wins; otherwise `logging.level` shifted by `-v`/`-q`. Library
/// `log` records reach the subscriber through its log bridge.
fn init_logging(config: &AppConfig, verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => config.logging.level.as_str(),
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skiff={level},tower_http={level}")));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose > 1)
        .try_init()
        .is_err()
    {
        eprintln!("skiff: a global logger was already installed");
    }
}

/// Data and state roots: `paths.*` when configured, else under the platform
/// data directory.
fn resolve_dirs(config: &AppConfig) -> Result<(PathBuf, PathBuf)> {
    let data_dir = match &config.paths.data_dir {
        Some(dir) => expand_path(dir).context("expanding paths.data_dir")?,
        None => dirs::data_local_dir()
            .ok_or_else(|| anyhow!("unable to determine data directory"))?
            .join("skiff"),
    };
    let state_dir = match &config.paths.state_dir {
        Some(dir) => expand_path(dir).context("expanding paths.state_dir")?,
        None => data_dir.join("state"),
    };
    Ok((data_dir, state_dir))
}

async fn serve(config: AppConfig, args: ServeArgs) -> Result<()> {
    let (data_dir, state_dir) = resolve_dirs(&config)?;
    let sandbox_dir = match &config.sandbox.base_dir {
        Some(dir) => expand_path(dir).context("expanding sandbox.base_dir")?,
        None => data_dir.join("sandboxes"),
    };
    for dir in [&state_dir, &sandbox_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let state = create_state_store(StateStoreConfig::File(state_dir.join("sessions")));
    info!("Session state: {}", state_dir.display());

    let sandboxes = Arc::new(LocalSandboxProvider::new(LocalSandboxConfig {
        base_dir: sandbox_dir.clone(),
    }));
    info!("Local sandboxes: {}", sandbox_dir.display());

    let storage = Arc::new(RsyncStorage::new(config.storage.rsync_config()));
    info!(
        "Durable storage: bucket {} mounted at {}",
        config.storage.bucket, config.storage.mount_path
    );

    let record_store_url = args
        .record_store_url
        .unwrap_or_else(|| config.record_store.base_url.clone());
    let records = Arc::new(
        HttpRecordStore::new(
            &record_store_url,
            Duration::from_secs(config.record_store.request_timeout_secs),
        )
        .context("creating record store client")?,
    );
    info!("Record store: {}", record_store_url);

    let sessions = SessionRegistry::new(SessionServices {
        sandboxes,
        storage,
        records,
        state,
        supervisor: Supervisor::new(),
        config: config.session_config(),
    });

    let app = api::create_router(
        api::AppState::new(sessions.clone()).with_cors_origins(config.server.cors_origins.clone()),
    );

    let host = args.host.unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("Syncing and stopping {} session(s)", sessions.len());
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if !sessions.shutdown(timeout).await {
        warn!("Shutdown timed out after {:?}; some syncs may not have finished", timeout);
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutdown signal received");
}

//! sigrand - random signature daemon
//!
//! Waits for a reader to open a named pipe, picks one entry from a
//! fortune-style signature file uniformly at random, writes it, closes the
//! pipe and starts over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use sigrand_daemon::config::{default_config_path, LoggingConfig};
use sigrand_daemon::{ConfigManager, Daemon, DaemonConfig};
use sigrand_system::{process_alive, read_lock_pid, signal_process};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// sigrand - serve a random signature through a named pipe
#[derive(Parser)]
#[command(name = "sigrand")]
#[command(about = "Serve a random signature to every reader of a named pipe")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    start: StartArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground (default)
    Start(StartArgs),
    /// Stop a running daemon
    Stop(StopArgs),
    /// Check daemon status
    Status(StatusArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signature file to draw entries from
    #[arg(long)]
    source: Option<String>,

    /// Named pipe readers open
    #[arg(long)]
    fifo: Option<String>,

    /// Lock file path
    #[arg(long)]
    lock: Option<String>,

    /// Fixed seed for the entry generator
    #[arg(long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Args)]
struct StopArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Lock file path
    #[arg(long)]
    lock: Option<String>,

    /// Force stop (SIGKILL) and remove the lock file
    #[arg(short, long)]
    force: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Lock file path
    #[arg(long)]
    lock: Option<String>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start(args)) => start_daemon(args).await,
        None => start_daemon(cli.start).await,
        Some(Commands::Stop(args)) => stop_daemon(args).await,
        Some(Commands::Status(args)) => show_status(args).await,
        Some(Commands::Validate(args)) => validate_config(args).await,
        Some(Commands::Config(args)) => generate_config(args).await,
    }
}

/// Layer defaults, config file and environment
async fn load_config(path: Option<&Path>) -> Result<ConfigManager> {
    let mut manager = ConfigManager::new();
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if path.exists() {
        manager
            .load_from_file(&path)
            .await
            .with_context(|| "Failed to load configuration")?;
    }

    manager.apply_env()?;
    Ok(manager)
}

/// Start the sigrand daemon
async fn start_daemon(args: StartArgs) -> Result<()> {
    let mut config_manager = load_config(args.config.as_deref()).await?;

    // Apply CLI overrides
    {
        let config = config_manager.config_mut();
        if let Some(source) = args.source {
            config.paths.source = source;
        }
        if let Some(fifo) = args.fifo {
            config.paths.fifo = fifo;
        }
        if let Some(lock) = args.lock {
            config.paths.lock = lock;
        }
        if let Some(seed) = args.seed {
            config.selection.seed = Some(seed);
        }
    }

    let config = config_manager.get_config();
    init_tracing(&config.logging, args.debug)?;

    info!("Starting sigrand v{}", env!("CARGO_PKG_VERSION"));
    match config_manager.config_path() {
        Some(path) => info!("Using configuration from {}", path.display()),
        None => warn!("Configuration file not found, using defaults"),
    }

    ConfigManager::validate(&config)?;

    if config.server.enable_metrics {
        init_metrics(&config)?;
    }

    let daemon = Daemon::new(config)?;
    daemon.run().await
}

/// Stop the daemon recorded in the lock file
async fn stop_daemon(args: StopArgs) -> Result<()> {
    init_tracing(&LoggingConfig::default(), false)?;

    let mut config_manager = load_config(args.config.as_deref()).await?;
    if let Some(lock) = args.lock {
        config_manager.config_mut().paths.lock = lock;
    }
    let lock_path = config_manager.get_config().paths.lock_path();

    let Some(pid) = read_lock_pid(&lock_path)? else {
        anyhow::bail!("No running instance: no pid in {}", lock_path.display());
    };

    if !process_alive(pid) {
        if args.force {
            warn!("Removing stale lock file for pid {}", pid);
            std::fs::remove_file(&lock_path)
                .with_context(|| format!("Failed to remove {}", lock_path.display()))?;
            return Ok(());
        }
        anyhow::bail!(
            "Process {} from {} is not running; rerun with --force to remove the stale lock",
            pid,
            lock_path.display()
        );
    }

    if args.force {
        info!("Force stopping sigrand (pid {})", pid);
    } else {
        info!("Gracefully stopping sigrand (pid {})", pid);
    }
    signal_process(pid, args.force)?;

    // Graceful shutdown removes the lock file; SIGKILL leaves it behind
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if !lock_path.exists() {
            info!("sigrand stopped");
            return Ok(());
        }
        if args.force && !process_alive(pid) {
            std::fs::remove_file(&lock_path)
                .with_context(|| format!("Failed to remove {}", lock_path.display()))?;
            info!("sigrand killed; removed {}", lock_path.display());
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    anyhow::bail!("sigrand (pid {}) did not stop within 5 seconds", pid)
}

/// Show daemon status
async fn show_status(args: StatusArgs) -> Result<()> {
    let mut config_manager = load_config(args.config.as_deref()).await?;
    if let Some(lock) = args.lock {
        config_manager.config_mut().paths.lock = lock;
    }
    let config = config_manager.get_config();
    let lock_path = config.paths.lock_path();

    println!("sigrand Daemon Status");
    println!("=====================");
    println!("Source: {}", config.paths.source_path().display());
    println!("Pipe:   {}", config.paths.fifo_path().display());
    println!("Lock:   {}", lock_path.display());

    match read_lock_pid(&lock_path)? {
        Some(pid) if process_alive(pid) => println!("Status: running (pid {pid})"),
        Some(pid) => println!("Status: stale lock (pid {pid} is not running)"),
        None if lock_path.exists() => println!("Status: lock file present without a pid"),
        None => println!("Status: not running"),
    }
    Ok(())
}

/// Validate configuration file
async fn validate_config(args: ValidateArgs) -> Result<()> {
    let path = args.config.unwrap_or_else(default_config_path);

    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&path).await?;
    ConfigManager::validate(&config_manager.get_config())?;

    println!("✓ Configuration is valid: {}", path.display());
    Ok(())
}

/// Generate default configuration file
async fn generate_config(args: ConfigArgs) -> Result<()> {
    let output = args.output.unwrap_or_else(default_config_path);
    if output.exists() && !args.force {
        anyhow::bail!("Configuration file already exists: {}", output.display());
    }

    ConfigManager::new().save_to_file(&output).await?;

    println!("Generated configuration file: {}", output.display());
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(logging: &LoggingConfig, debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { logging.level.as_str() };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(fmt_layer.compact()).try_init()?;
    } else {
        registry.with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Initialize Prometheus metrics
fn init_metrics(config: &DaemonConfig) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], config.server.metrics_port))
        .install()
        .context("Failed to start metrics exporter")?;

    info!(
        "Metrics endpoint started on port {}",
        config.server.metrics_port
    );
    Ok(())
}

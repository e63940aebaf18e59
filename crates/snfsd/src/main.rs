//! snfsd: SecureNoteFS daemon
//!
//! Usage:
//!   snfsd [--config snfs.toml] [mount|init|passwd|snapshot|restore]
//!
//! Commands:
//!   mount     - Restore if needed, unlock, mount until signalled, snapshot [default]
//!   init      - Create the key file with a fresh master key
//!   passwd    - Rewrap the master key under a new passphrase
//!   snapshot  - Archive the physical root now
//!   restore   - Restore the newest snapshot into an empty physical root

mod daemon;
mod passphrase;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

use snfs_core::config::SnfsConfig;
use daemon::DaemonPaths;

#[derive(Parser, Debug)]
#[command(name = "snfsd", version, about = "SecureNoteFS encrypted filesystem daemon")]
struct Cli {
    /// Path to snfs.toml configuration file
    #[arg(long, short = 'c', env = "SNFS_CONFIG", default_value = "snfs.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [daemon] log_level
    #[arg(long, env = "SNFS_LOG")]
    log: Option<String>,

    /// Log format; overrides [daemon] log_format
    #[arg(long, env = "SNFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Mount the virtual root (default)
    Mount,
    /// Create the key file
    Init,
    /// Change the passphrase protecting the master key
    Passwd,
    /// Snapshot the physical root into the archive directory
    Snapshot,
    /// Restore the newest snapshot if the physical root is empty
    Restore,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings may come from the config, so read it first and report
    // problems once the subscriber is up.
    let loaded = SnfsConfig::load(&cli.config);
    let (level, format) = match &loaded {
        Ok(config) => (
            cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone()),
            cli.log_format
                .clone()
                .unwrap_or_else(|| parse_log_format(&config.daemon.log_format)),
        ),
        Err(_) => (
            cli.log.clone().unwrap_or_else(|| "info".into()),
            cli.log_format.clone().unwrap_or(LogFormat::Text),
        ),
    };
    init_logging(&level, &format);

    let config = loaded.with_context(|| format!("loading {}", cli.config.display()))?;
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    let command = cli.command.unwrap_or(Command::Mount);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?command,
        config = %cli.config.display(),
        "snfsd starting"
    );

    match command {
        Command::Mount => daemon::run(config).await,
        Command::Init => cmd_init(&config),
        Command::Passwd => cmd_passwd(&config),
        Command::Snapshot => cmd_snapshot(&config),
        Command::Restore => cmd_restore(&config),
    }
}

fn cmd_init(config: &SnfsConfig) -> Result<()> {
    let paths = DaemonPaths::resolve(config);
    let keys = daemon::key_manager(config, &paths);
    if keys.is_initialized() {
        bail!("key file already exists: {}", keys.path().display());
    }
    keys.first_run_setup(passphrase::new_for(passphrase::PASSPHRASE_ENV)?)
        .context("creating key file")?;
    println!("Key file created: {}", keys.path().display());
    Ok(())
}

fn cmd_passwd(config: &SnfsConfig) -> Result<()> {
    let paths = DaemonPaths::resolve(config);
    let keys = daemon::key_manager(config, &paths);
    let old = passphrase::current()?;
    let new = passphrase::new_for(passphrase::NEW_PASSPHRASE_ENV)?;
    keys.change_passphrase(old, new)
        .context("changing passphrase")?;
    println!("Passphrase changed: {}", keys.path().display());
    Ok(())
}

fn cmd_snapshot(config: &SnfsConfig) -> Result<()> {
    let paths = DaemonPaths::resolve(config);
    let report = daemon::archive_manager(config, &paths)
        .snapshot(&paths.physical_root)
        .with_context(|| format!("snapshotting {}", paths.physical_root.display()))?;
    println!(
        "Snapshot written: {} ({} entries, {} bytes compressed)",
        report.snapshot.path.display(),
        report.entries,
        report.compressed_bytes
    );
    Ok(())
}

fn cmd_restore(config: &SnfsConfig) -> Result<()> {
    let paths = DaemonPaths::resolve(config);
    match daemon::archive_manager(config, &paths)
        .restore_latest(&paths.physical_root)
        .with_context(|| format!("restoring {}", paths.physical_root.display()))?
    {
        Some(snapshot) => println!("Restored {}", snapshot.path.display()),
        None => println!(
            "Nothing restored: {} is not empty or no snapshot exists",
            paths.physical_root.display()
        ),
    }
    Ok(())
}

fn parse_log_format(s: &str) -> LogFormat {
    if s.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

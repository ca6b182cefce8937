use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rusty_backup_engine::{setup_config, Engine};
use std::sync::mpsc;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "rusty-backup-engine")]
#[command(about = "Scheduled backup engine host process", long_about = None)]
struct Cli {
    #[arg(
        short = 'c',
        long = "config",
        default_value = "engine.json",
        env = "RUSTY_BACKUP_ENGINE_CONFIG"
    )]
    config_file: String,

    #[arg(
        short = 'l',
        long = "log-level",
        default_value = "info",
        env = "LOG_LEVEL"
    )]
    log_level: String,

    #[arg(short = 'v', long = "validate-only")]
    validate_only: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_secs()
        .init();

    info!("rusty-backup-engine starting...");
    let config_file = args
        .config_file
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string();
    let config = setup_config(config_file).context("Failed to load configuration")?;
    debug!("Loaded config: {:?}", &config);

    if args.validate_only {
        info!("Configuration is valid. Exiting (--validate-only mode).");
        return Ok(());
    }

    let engine = Engine::open(config).context("Failed to open backup engine")?;
    info!("{} task(s) registered", engine.list_tasks().len());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    engine
        .start_scheduler()
        .context("Failed to start scheduler")?;

    // Block until Ctrl+C.
    let _ = rx.recv();
    info!("Shutdown requested, cancelling running tasks");
    engine.shutdown(SHUTDOWN_GRACE);
    Ok(())
}

//! tilestore admin tool
//!
//! Inspects store files and their rollback logs, and rolls a store back to
//! an earlier timestamp.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::json;
use thiserror::Error;
use tilestore::{BufferManager, FileError, RollbackLog, StoreConfig, StoreHeader, Timestamp};
use tracing_subscriber::{EnvFilter, fmt};

/// tilestore admin CLI
#[derive(Parser, Debug)]
#[command(name = "tilestore")]
#[command(about = "Inspect and repair tilestore block files")]
#[command(version)]
struct Args {
    /// Store configuration as a JSON file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header and free-list of a store file
    Inspect {
        /// The store file
        file: PathBuf,
    },

    /// Print the rollback log of a store file, newest entry first
    Log {
        /// The store file
        file: PathBuf,
    },

    /// Undo every mutation stamped at or after a timestamp
    Rollback {
        /// The store file
        file: PathBuf,

        /// Earliest timestamp to undo
        #[arg(long)]
        to: Timestamp,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    File(#[from] FileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("No rollback log at {0}")]
    MissingLog(PathBuf),
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => StoreConfig::default(),
    };

    match args.command {
        Commands::Inspect { file } => inspect(&file, &config),
        Commands::Log { file } => log(&file, &config),
        Commands::Rollback { file, to } => rollback(&file, to, config),
    }
}

fn inspect(path: &Path, config: &StoreConfig) -> Result<(), CliError> {
    let header = StoreHeader::load(path)?;
    let file_len = std::fs::metadata(path)?.len();

    // Open without a rollback log so inspecting never creates one
    let plain = StoreConfig {
        rollback: false,
        ..config.clone()
    };
    let mut buffer = BufferManager::open(path, header.kind, header.block_size, &plain)?;
    let free_blocks = buffer.free_blocks()?;

    let report = json!({
        "header": header,
        "file_len": file_len,
        "free_blocks": free_blocks,
        "rollback_log": config.rollback_path(path).exists(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn log(path: &Path, config: &StoreConfig) -> Result<(), CliError> {
    let header = StoreHeader::load(path)?;
    let log_path = config.rollback_path(path);
    if !log_path.exists() {
        return Err(CliError::MissingLog(log_path));
    }

    let mut log = RollbackLog::open(&log_path, header.block_size)?;
    for entry in log.entries()? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn rollback(path: &Path, to: Timestamp, config: StoreConfig) -> Result<(), CliError> {
    let header = StoreHeader::load(path)?;
    let log_path = config.rollback_path(path);
    if !log_path.exists() {
        return Err(CliError::MissingLog(log_path));
    }

    let config = StoreConfig {
        rollback: true,
        ..config
    };
    let mut buffer = BufferManager::open(path, header.kind, header.block_size, &config)?;
    let undone = buffer.roll_back(to)?;
    buffer.close()?;

    tracing::info!(file = %path.display(), timestamp = to, undone, "rolled back");
    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use snapvault::config::{load_config, normalize_log_level, validate_config, Config};
use snapvault::object_store::S3ObjectStore;
use snapvault::orchestrator::{BackupOrchestrator, BackupRequest, RestoreOrchestrator, RestoreRequest};
use snapvault::snapshot::ShellRunner;
use snapvault::verify::ShellSubvolumeShowRunner;

#[derive(Parser)]
#[command(name = "snapvault", about = "btrfs snapshot backup/restore against an S3-compatible store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and run a backup pass over the configured subvolumes.
    Backup {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        log_level: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "subvolume")]
        subvolume: Vec<String>,
        #[arg(long)]
        once: bool,
        #[arg(long)]
        no_s3: bool,
    },
    /// Replay a subvolume's manifest chain back onto a target path.
    Restore {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        log_level: Option<String>,
        #[arg(long)]
        subvolume: String,
        #[arg(long)]
        target: PathBuf,
        #[arg(long = "manifest-key")]
        manifest_key: Option<String>,
        #[arg(long)]
        restore_timeout: Option<u64>,
        #[arg(long, overrides_with = "no_wait_restore")]
        wait_restore: bool,
        #[arg(long, overrides_with = "wait_restore")]
        no_wait_restore: bool,
        #[arg(long)]
        verify: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Backup {
            config,
            log_level,
            dry_run,
            subvolume,
            once,
            no_s3,
        } => {
            let config = match load_and_override_config(&config, log_level.as_deref()) {
                Ok(config) => config,
                Err(code) => return code,
            };
            init_logging(&config.global.log_level);

            let store = Arc::new(
                S3ObjectStore::new(config.s3.bucket.clone(), config.s3.region.clone(), None).await,
            );
            let orchestrator = BackupOrchestrator::new(config, store, ShellRunner);
            let request = BackupRequest {
                dry_run,
                subvolume_names: if subvolume.is_empty() { None } else { Some(subvolume) },
                once,
                no_s3,
            };
            exit_code(orchestrator.run(&request).await)
        }
        Command::Restore {
            config,
            log_level,
            subvolume,
            target,
            manifest_key,
            restore_timeout,
            wait_restore,
            no_wait_restore,
            verify,
        } => {
            let config = match load_and_override_config(&config, log_level.as_deref()) {
                Ok(config) => config,
                Err(code) => return code,
            };
            init_logging(&config.global.log_level);

            let store = S3ObjectStore::new(config.s3.bucket.clone(), config.s3.region.clone(), None).await;
            let wait_restore_flag = if no_wait_restore {
                Some(false)
            } else if wait_restore {
                Some(true)
            } else {
                None
            };
            let orchestrator = RestoreOrchestrator::new(config, store, ShellSubvolumeShowRunner);
            let request = RestoreRequest {
                subvolume,
                target,
                manifest_key,
                restore_timeout,
                wait_restore: wait_restore_flag,
                verify,
            };
            exit_code(orchestrator.run(&request).await)
        }
    }
}

/// Loads config from `path`, applies a `--log-level` override, and
/// re-validates the result.
fn load_and_override_config(path: &std::path::Path, log_level: Option<&str>) -> Result<Config, ExitCode> {
    let mut config = load_config(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(2)
    })?;
    if let Some(level) = log_level {
        config.global.log_level = normalize_log_level(level);
    }
    validate_config(&config).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(2)
    })?;
    Ok(config)
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(code.clamp(0, 255) as u8)
}

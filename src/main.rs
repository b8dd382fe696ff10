use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use grafana_sidecar_users_yaml::config::ConfigError;
use grafana_sidecar_users_yaml::daemon::{self, ConsoleNarrator, StartOptions};
use grafana_sidecar_users_yaml::logging::{init_logging, LogConfig, Verbosity};
use grafana_sidecar_users_yaml::VERSION;

#[derive(Parser)]
#[command(name = "grafana-sidecar-users-yaml")]
#[command(about = "Updates Grafana user org role from file")]
#[command(
    long_about = "Periodically reads a YAML file of Grafana organizations and the logins that should be viewers, editors and admins in each, and writes those roles into Grafana's SQLite database."
)]
struct Cli {
    /// Increase diagnostic logging on stderr (repeatable)
    #[arg(long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write diagnostic logs to this file
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts the daemon
    Start {
        /// YAML file with users
        #[arg(short, long)]
        config: PathBuf,

        /// Quiet mode (accepted, output is not suppressed yet)
        #[arg(short, long)]
        quiet: bool,

        /// Ignore errors and continue
        #[arg(short, long)]
        ignore_errors: bool,
    },
    /// Prints version
    Version,
}

/// Treat a lone `-v` or `--version` as the `version` command.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args: Vec<OsString> = args.into_iter().collect();
    if args.len() == 2 && (args[1] == "-v" || args[1] == "--version") {
        args[1] = OsString::from("version");
    }
    args
}

/// The config flag must name an existing regular file.
fn ensure_config_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_file() {
        anyhow::bail!("Config file is not a regular file: {}", path.display());
    }
    Ok(())
}

async fn start(options: StartOptions) -> Result<ExitCode> {
    ensure_config_file(&options.config_path)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let mut narrator = ConsoleNarrator;
    match daemon::run(&options, &cancel, &mut narrator).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        // The failing tick has already reported the error on stderr.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

/// Cancel the loop on Ctrl+C or SIGTERM.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    let _guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_occurrences(cli.verbose),
        log_file: cli.log_file.clone(),
    });

    match cli.command {
        Commands::Version => {
            println!("{}", VERSION);
            ExitCode::SUCCESS
        }
        Commands::Start {
            config,
            quiet,
            ignore_errors,
        } => {
            let options = StartOptions {
                ignore_errors,
                quiet,
                ..StartOptions::new(config)
            };

            match start(options).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

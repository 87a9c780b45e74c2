use clap::{Parser, Subcommand};
use derive_more::{Display, Error};
use exn::ResultExt;
use folio_config::Config;
use folio_database::{Database, Repository};
use folio_library::{Collaborators, LibraryService, LoggingMetadataService, LoggingNotificationSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "FOLIO_LOG";

type Result<T> = std::result::Result<T, exn::Exn<AppError>>;

#[derive(Debug, Display, Error)]
enum AppError {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the index database")]
    Database,
    #[display("could not start the library service")]
    Library,
    #[display("i/o error")]
    Io,
}

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Keep a media library index in sync with its folders")]
struct Cli {
    /// Configuration file. Defaults to `config.toml` in the platform config directory.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch every root and keep the index up to date until interrupted.
    Watch,
    /// Scan once, and exit when the index has caught up.
    Scan {
        /// Only scan this folder (and everything below it).
        path: Option<PathBuf>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Exiting after failure");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| AppError::Config)?;
    let database_path = config.database_path().or_raise(|| AppError::Config)?;
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent).or_raise(|| AppError::Io)?;
    }
    let database = Database::connect(&database_path).await.or_raise(|| AppError::Database)?;
    tracing::debug!(path = %database_path.display(), "Opened index database");

    let collaborators = Collaborators {
        notifications: Arc::new(LoggingNotificationSink),
        metadata: Arc::new(LoggingMetadataService),
    };
    let repository = Repository::from(&database);
    let result = match cli.command {
        Command::Watch => watch(&config, repository, collaborators).await,
        Command::Scan { path } => scan(&config, repository, collaborators, path).await,
    };
    database.close().await;
    result
}

async fn watch(config: &Config, repository: Repository, collaborators: Collaborators) -> Result<()> {
    let service = LibraryService::start(config, repository, collaborators, true).or_raise(|| AppError::Library)?;
    // Catch up on whatever changed while we were not watching.
    service.scan_all();
    let signal = tokio::signal::ctrl_c().await;
    service.shutdown().await;
    signal.or_raise(|| AppError::Io)
}

async fn scan(
    config: &Config,
    repository: Repository,
    collaborators: Collaborators,
    path: Option<PathBuf>,
) -> Result<()> {
    let service = LibraryService::start(config, repository, collaborators, false).or_raise(|| AppError::Library)?;
    let mut completions = service.completions();
    match path {
        Some(path) => {
            let path = std::path::absolute(&path).or_raise(|| AppError::Io)?;
            service.request_scan(path, true);
        },
        None => service.scan_all(),
    }
    tokio::select! {
        completed = completions.recv() => match completed {
            Ok(completed) => tracing::info!(elapsed = ?completed.elapsed, "Index is up to date"),
            Err(err) => tracing::warn!(error = %err, "Lost track of scan progress"),
        },
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }
    service.shutdown().await;
    Ok(())
}

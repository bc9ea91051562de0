use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use teledrive_core::fuse::{MediaFs, MountOptions, mount};
use teledrive_core::http::{AppState, PAGE_SIZE, WebSettings, serve};
use teledrive_core::logging::init_logging;
use teledrive_core::{
    APP_NAME, Config, Error, MediaRepository, SqliteMediaRepository, WorkerPool, index_message,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "teledrive")]
#[command(about = "Serve media archived in a Telegram channel over HTTP or FUSE", long_about = None)]
struct Cli {
    /// Print results as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream media over HTTP.
    Web,
    /// Mount the archive as a read-only directory.
    Fuse {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        debug: bool,
    },
    /// Record archived messages in the media repository.
    Index {
        #[arg(required = true)]
        message_ids: Vec<i32>,
    },
    /// Print one page of media records.
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        let code = match &e {
            Error::InvalidConfig { .. } => "config.invalid",
            Error::Auth { .. } => "remote.unauthorized",
            Error::NotFound { .. } => "remote.not_found",
            Error::FloodWait { .. } | Error::FloodWaitTooLong { .. } | Error::Timeout => {
                "remote.unavailable"
            }
            Error::Sqlite(_) | Error::SqliteMigrate(_) => "db.failed",
            Error::Io(_) => "io.failed",
            _ => "internal",
        };
        Self {
            code,
            retryable: e.is_transient() || matches!(e, Error::FloodWaitTooLong { .. }),
            message: e.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_env()?;
    init_logging(config.log_level.as_deref(), config.log_format);
    info!(event = "app.start", app = APP_NAME, "app.start");

    match cli.cmd {
        Command::Web => web(&config).await,
        Command::Fuse {
            dir,
            allow_other,
            debug,
        } => {
            let dir = dir.unwrap_or_else(|| config.fuse_dir.clone());
            fuse(&config, dir, MountOptions { allow_other, debug }).await
        }
        Command::Index { message_ids } => index(&config, &message_ids, cli.json).await,
        Command::List { page } => list(&config, page, cli.json).await,
    }
}

async fn web(config: &Config) -> Result<(), CliError> {
    let settings = WebSettings::from_config(config)?;
    let repo = SqliteMediaRepository::open(&config.database_path).await?;
    let pool = Arc::new(WorkerPool::connect(config).await?);
    let state = AppState {
        pool: Arc::clone(&pool),
        repo: Arc::new(repo),
        settings: Arc::new(settings),
    };

    let served = serve(config.http_addr, state, shutdown_signal()).await;
    pool.shutdown().await;
    served.map_err(CliError::from)
}

async fn fuse(config: &Config, dir: PathBuf, options: MountOptions) -> Result<(), CliError> {
    let repo = SqliteMediaRepository::open(&config.database_path).await?;
    let pool = Arc::new(WorkerPool::connect(config).await?);
    let fs = Arc::new(MediaFs::new(Arc::new(repo), Arc::clone(&pool)));

    let mounted = match mount(fs, &dir, &options) {
        Ok(mounted) => mounted,
        Err(e) => {
            pool.shutdown().await;
            return Err(e.into());
        }
    };
    shutdown_signal().await;

    if let Err(e) = tokio::task::spawn_blocking(move || mounted.unmount()).await {
        warn!(event = "fuse.unmount_panicked", error = %e, "fuse.unmount_panicked");
    }
    pool.shutdown().await;
    Ok(())
}

async fn index(config: &Config, message_ids: &[i32], json: bool) -> Result<(), CliError> {
    let repo = SqliteMediaRepository::open(&config.database_path).await?;
    let pool = WorkerPool::connect(config).await?;
    let worker = pool.next_worker();

    let mut failed = 0usize;
    for &message_id in message_ids {
        match index_message(&worker, &repo, message_id).await {
            Ok(record) if json => println!("{}", serde_json::json!({ "media": record })),
            Ok(record) => println!("{}\t{}\t{}", record.id, record.message_id, record.display_name()),
            Err(e) => {
                failed += 1;
                warn!(
                    event = "index.failed",
                    message_id,
                    error = %e,
                    "index.failed"
                );
            }
        }
    }
    pool.shutdown().await;

    if failed > 0 {
        return Err(CliError::new(
            "index.partial",
            format!("{failed} of {} messages could not be indexed", message_ids.len()),
        ));
    }
    Ok(())
}

async fn list(config: &Config, page: u32, json: bool) -> Result<(), CliError> {
    let repo = SqliteMediaRepository::open(&config.database_path).await?;
    let page = page.max(1);
    let items = repo.list_page(page, PAGE_SIZE).await?;
    let total = repo.count().await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "page": page, "per_page": PAGE_SIZE, "total": total, "items": items })
        );
        return Ok(());
    }
    for record in &items {
        println!(
            "{}\t{}\t{}\t{}",
            record.id,
            record.message_id,
            record.meta.file_size,
            record.display_name()
        );
    }
    println!("page {page}, {} of {total}", items.len());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(event = "app.signal_failed", error = %e, "app.signal_failed");
        std::future::pending::<()>().await;
    }
    info!(event = "app.shutdown", "app.shutdown");
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vidcache_engine::{CacheIndex, DownloadOrchestrator, EvictionManager, FetchTool, YtDlp};

mod api;
mod cli;
mod config;
mod error;
mod settings;
mod utils;

use api::AppState;
use cli::CliArgs;
use config::ServerConfig;
use error::AppError;
use settings::SettingsFileLimit;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    let _log_guard = init_logging(&args)?;

    info!(version = env!("CARGO_PKG_VERSION"), "vidcache starting");

    let config = ServerConfig::resolve(&args).await?;
    config.log_summary();

    // fail fast when the fetch tool cannot run
    let tool = Arc::new(YtDlp::from_config(&config.engine));
    tool.version().await?;

    let index = CacheIndex::open(&config.engine.storage_dir).await?;
    let limit = Arc::new(SettingsFileLimit::new(
        config.settings_file.clone(),
        config.fallback_limit,
    ));
    let eviction = Arc::new(EvictionManager::new(index.clone(), limit));
    let orchestrator = DownloadOrchestrator::new(
        index,
        tool,
        config.engine.clone(),
        eviction.clone(),
        Arc::new(config.cookies_source()),
    );

    let cancel = CancellationToken::new();
    let eviction_task = eviction
        .clone()
        .spawn(config.engine.eviction_interval, cancel.clone());

    let state = AppState::new(
        orchestrator.clone(),
        eviction,
        config.public_base_url.clone(),
    );
    let app = api::router(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, base_url = %config.public_base_url, "Listening");

    let shutdown = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down");
            cancel.cancel();
            // ends open progress streams so connections can drain
            orchestrator.shutdown().await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let _ = eviction_task.await;
    info!("Stopped");
    Ok(())
}

fn init_logging(args: &CliArgs) -> Result<Option<WorkerGuard>, AppError> {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    match &args.log_file {
        Some(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (file_writer, guard) = tracing_appender::non_blocking(log_file);
            let subscriber = builder
                .with_writer(MakeWriterExt::and(std::io::stdout, file_writer))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Initialization(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = builder.with_ansi(true).finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| AppError::Initialization(e.to_string()))?;
            Ok(None)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

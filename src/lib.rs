use clap::ValueEnum;
use cli::Cli;
use server::run_server;
use startup_coordinator::spawn_model_initialization;
use std::{future::Future, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
pub mod api;
pub mod assemble;
pub mod boxes;
pub mod cli;
pub mod fallback;
pub mod geometry;
pub mod image;
pub mod models;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod source;
pub mod startup_coordinator;
pub mod store;
pub mod stream;
pub mod yolo;

/// Starts model loading in the background and returns the server future
/// together with the token that shuts it down.
pub fn plate_scribe_service(
    args: Cli,
) -> (impl Future<Output = anyhow::Result<()>>, CancellationToken) {
    log_execution_provider(args.force_cpu);

    let init_receiver = spawn_model_initialization(args.model_config());

    let cancel_token = CancellationToken::new();
    let server_future = run_server(args.server_config(), cancel_token.clone(), init_receiver);

    (server_future, cancel_token)
}

pub fn direct_ml_available() -> bool {
    #[cfg(not(windows))]
    {
        false
    }
    #[cfg(windows)]
    {
        let Ok(exe_path) = std::env::current_exe() else {
            return false;
        };
        let Some(exe_dir) = exe_path.parent() else {
            return false;
        };
        exe_dir.join("DirectML.dll").exists()
    }
}

fn log_execution_provider(force_cpu: bool) {
    if force_cpu {
        info!("CPU inference forced with --force-cpu");
    } else if direct_ml_available() {
        info!("DirectML is available for GPU inference");
    } else {
        info!("GPU acceleration not available - only CPU inference will be supported");
    }
}

pub fn init_logging(
    log_level: LogLevel,
    log_path: &mut Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    setup_ansi_support();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let guard = if let Some(path) = log_path.clone() {
        let log_directory = if path.starts_with(".") {
            let stripped = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.join(stripped.clone())))
                .unwrap_or(stripped)
        } else {
            path
        };

        *log_path = Some(log_directory.clone());

        let log_file = log_directory.join("plate_scribe.log");
        println!("Starting Plate Scribe, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "plate_scribe.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(?log_level, "Logging initialized");
    Ok(guard)
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

fn setup_ansi_support() {
    #[cfg(target_os = "windows")]
    if let Err(e) = ansi_term::enable_ansi_support() {
        eprintln!("Failed to enable ANSI support: {e}");
    }
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

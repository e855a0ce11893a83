use anyhow::Result;
use clap::Parser;
use daemon::config::Config;
use daemon::ipc_server::{self, IpcContext};
use daemon::slideshow::{self, Slideshow};
use daemon::{DaemonState, build_pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

#[derive(Parser, Debug)]
#[command(name = "vitrine")]
#[command(about = "Weighted wallpaper slideshow daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/vitrine/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let loaded = Config::load_from_path(&config_path);

    let default_level = args
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.general.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    log::info!("Starting vitrine v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Looking for config at: {}", config_path.display());

    let config = match loaded {
        Ok(cfg) => {
            log::info!("✓ Configuration loaded successfully");
            log::info!("  General settings:");
            log::info!("    - Log level: {}", cfg.general.log_level);
            log::info!("    - Size: {}", cfg.general.size());
            log::info!("    - Interval: {}s", cfg.general.interval);
            log::info!(
                "    - Supplier slots per producer: {}",
                cfg.general.producer_buffer_size
            );
            if cfg.producer.is_empty() {
                log::warn!("  Producers: none configured, nothing will be shown");
            } else {
                log::info!("  Producers:");
                for producer in &cfg.producer {
                    log::info!(
                        "    - {} ({}, weight {}, filter {})",
                        producer.name,
                        producer.kind,
                        producer.weight,
                        producer.filter()
                    );
                }
            }
            cfg
        }
        Err(e) => {
            log::warn!("Failed to load config: {:#}. Using defaults.", e);
            Config::default()
        }
    };

    let supplier = build_pipeline(&config).await?;
    let state = Arc::new(Mutex::new(DaemonState::new()));
    let (slideshow_tx, slideshow_rx) = mpsc::unbounded_channel();

    // Start IPC server
    let ipc_context = IpcContext {
        state: state.clone(),
        supplier: supplier.clone(),
        slideshow_tx,
    };
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::start(ipc_context).await {
            log::error!("IPC server error: {}", e);
        }
    });

    // Start the display loop
    let slideshow_state = state.clone();
    let interval = config.general.interval();
    let slideshow = Slideshow::new(supplier.clone());
    let slideshow_handle = tokio::spawn(async move {
        if let Err(e) = slideshow::run(slideshow, interval, slideshow_state, slideshow_rx).await {
            log::error!("Slideshow error: {}", e);
        }
    });

    // Set up signal handlers
    let signal_state = state.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to set up signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        signal_state.lock().await.should_exit = true;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = ipc_handle => {
            log::info!("IPC server stopped");
        }
        _ = slideshow_handle => {
            log::info!("Slideshow stopped");
        }
    }

    supplier.shutdown();
    log::info!("Daemon shutting down");
    Ok(())
}

//! troopwatchd - camera watch daemon
//!
//! This daemon:
//! 1. Loads configuration (TOML file, env overrides, CLI flags)
//! 2. Builds the detector backend and warms it up
//! 3. Serves the HTTP control and streaming API
//! 4. Runs the frame loop whenever a client starts the camera
//! 5. Stops the frame loop and the API on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use troopwatch::{
    api::{ApiConfig, ApiServer},
    config::WatchdConfig,
    BackendRegistry, LogAlertSink, Watcher,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "TROOPWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// API bind address (overrides the config file and TROOPWATCH_API_ADDR).
    #[arg(long, value_name = "HOST:PORT")]
    addr: Option<String>,
    /// Start the camera immediately instead of waiting for POST /webcam.
    #[arg(long)]
    autostart: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = WatchdConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let registry = BackendRegistry::from_settings(&config.detector)?;
    let detector = registry
        .default_backend()
        .ok_or_else(|| anyhow!("no detector backend registered"))?;
    registry.warm_up()?;
    log::info!(
        "detector backends: {:?} (target class '{}', threshold {})",
        registry.list(),
        config.detector.target_class,
        config.detector.confidence_threshold
    );

    let alert_sink = Arc::new(LogAlertSink::new(&config.detector.target_class));
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    log::info!(
        "camera {} ({}x{} @ {} fps), detections saved to {}",
        config.camera.url,
        config.camera.width,
        config.camera.height,
        config.camera.target_fps,
        config.history.dir.display()
    );
    let watcher = Watcher::new(config, detector, alert_sink)?;

    let api_handle = ApiServer::new(api_config, watcher.clone()).spawn()?;
    log::info!("troopwatchd api listening on {}", api_handle.addr);

    if args.autostart {
        match watcher.start(None) {
            Ok(outcome) => log::info!("autostart: {:?}", outcome),
            Err(err) => log::warn!("autostart failed: {}", err),
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("troopwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping camera and API server...");
    if let Err(err) = watcher.stop() {
        log::warn!("camera stop failed: {}", err);
    }
    api_handle.stop()?;

    Ok(())
}

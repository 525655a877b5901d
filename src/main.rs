use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use facecast::capture;
use facecast::config::Config;
use facecast::faces;
use facecast::logging;
use facecast::stream::{server, BroadcastLoop, ConnectionRegistry};

fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facecast {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config_path
}

fn print_help() {
    println!(
        r#"facecast - live face recognition broadcast over WebSocket

USAGE:
    facecast [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACECAST_CONFIG     Path to config file (overrides default location)
    FACECAST_LOG        Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facecast/config.toml

Clients connect with a WebSocket to any path on the configured bind address
and receive one JSON message per processed frame."#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = parse_args();

    let config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    logging::init(config.log_dir.clone())?;

    info!("Initializing models...");
    let pipeline = faces::load_pipeline(&config)?;
    info!("Models loaded successfully");

    let registry = Arc::new(ConnectionRegistry::new());
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, "Accepting subscribers");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Server shut down by user");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let server = tokio::spawn(server::serve(listener, Arc::clone(&registry), shutdown_rx.clone()));

    let capture_config = config.capture.clone();
    let mut broadcast = BroadcastLoop::new(registry, &config.stream);
    let result = broadcast
        .run(move || capture::open_source(&capture_config), pipeline, shutdown_rx)
        .await;

    // Whatever ended the loop also ends the server.
    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = %e, "Fatal error");
            Err(e.into())
        }
    }
}

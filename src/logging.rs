//! Logging setup.
//!
//! On Linux the journal is preferred. Elsewhere, or when journald is not
//! reachable, logs go to a daily rolling file if a log directory was
//! configured, otherwise to stderr.
//!
//! Verbosity comes from the `FACECAST_LOG` environment variable
//! (`trace`, `debug`, `info`, `warn`, `error`), defaulting to `info`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FACECAST_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber. Call once at startup.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald_layer)
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(&log_dir)?;

            let file_appender = tracing_appender::rolling::daily(&log_dir, "facecast.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Dropping the guard would stop the writer thread.
            let _ = GUARD.set(guard);

            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .try_init()?;

            tracing::info!(dir = ?log_dir, "Logging initialized with file backend");
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    Ok(())
}

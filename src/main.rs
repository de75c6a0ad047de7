//! Sentinel service entry point.
//!
//! Single-runtime, single-thread design: one Tokio current-thread
//! runtime drives the accept loop, all per-client tasks, and the
//! periodic maintenance jobs.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use sentinel::{Sentinel, SentinelConfig};

#[derive(Debug, Clone)]
struct AppConfig {
    socket_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    quarantine_dir: Option<PathBuf>,
    sandbox_binary: Option<PathBuf>,
    tier2_disabled: bool,
    log_level: Level,
}

impl AppConfig {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut config = Self::default();

        let mut i = 1_usize;
        while i < args.len() {
            match args[i].as_str() {
                "--socket" => {
                    if i + 1 < args.len() {
                        config.socket_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--data-dir" => {
                    if i + 1 < args.len() {
                        config.data_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--quarantine-dir" => {
                    if i + 1 < args.len() {
                        config.quarantine_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--sandbox-binary" => {
                    if i + 1 < args.len() {
                        config.sandbox_binary = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--no-tier2" => config.tier2_disabled = true,
                "--debug" => config.log_level = Level::DEBUG,
                "--trace" => config.log_level = Level::TRACE,
                _ => {}
            }
            i += 1;
        }

        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            data_dir: None,
            quarantine_dir: None,
            sandbox_binary: None,
            tier2_disabled: false,
            log_level: Level::INFO,
        }
    }
}

fn setup_logging(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sentinel={level}")));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let app = AppConfig::from_args();
    setup_logging(app.log_level);
    info!("starting sentinel service");

    let mut config = SentinelConfig::default();
    if let Some(path) = app.socket_path {
        config.socket_path = path;
    }
    if let Some(dir) = app.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = app.quarantine_dir {
        config.quarantine_dir = dir;
    }
    config.sandbox.sandbox_binary = app.sandbox_binary;
    if app.tier2_disabled {
        config.sandbox.enable_tier2 = false;
    }
    config.sandbox.timeout = Duration::from_secs(5);

    let sentinel = Sentinel::new(config)?;

    tokio::select! {
        result = sentinel.run() => {
            if let Err(e) = result {
                error!("server exited with error: {e}");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
    }

    Ok(())
}

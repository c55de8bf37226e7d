use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use super::dispatch::dispatch;
use super::env::CliArgs;
use super::runtime::init_logging;
use crate::config::{load_config, load_local_env_overrides, LOCAL_ENV_PATH};
use crate::metrics;

pub async fn run() -> Result<()> {
    let applied = load_local_env_overrides(Path::new(LOCAL_ENV_PATH));
    let cli = CliArgs::parse();

    let _log_guard = init_logging(
        &cli.log_level,
        cli.debug,
        cli.log_format,
        cli.log_file.as_deref(),
    )?;
    if applied > 0 {
        info!(path = LOCAL_ENV_PATH, applied, "Loaded environment overrides from local.env");
    }
    metrics::register_metrics();
    let _metrics_server = metrics::spawn_metrics_server(cli.metrics_port);

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("CDPCTL_GIT_HASH"),
        built = env!("CDPCTL_BUILD_DATE"),
        "Starting cdpctl"
    );

    let loaded = load_config(cli.config.as_deref())?;
    match dispatch(&cli, loaded).await {
        Ok(()) => {
            debug!("Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}

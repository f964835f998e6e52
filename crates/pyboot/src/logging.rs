use std::fs::File;
use std::path::Path;

use anyhow::Context;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOGGING_ENV: &str = "PYBOOT_LOG";
pub const LOGGING_FILE_ENV: &str = "PYBOOT_LOG_FILE";

/// Initializes a terminal subscriber, plus a more verbose `pyboot.log` file
/// when a log folder is provided.
pub fn init_logging(log_folder: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = log_folder
        .map(|folder| {
            let log_file = File::options()
                .create(true)
                .append(true)
                .open(folder.join("pyboot.log"))
                .context("failed to create a log file")?;
            anyhow::Ok(
                layer().with_writer(log_file).with_ansi(false).with_filter(
                    EnvFilter::builder()
                        .with_env_var(LOGGING_FILE_ENV)
                        .try_from_env()
                        .unwrap_or_else(|_| "pyboot=debug".into()),
                ),
            )
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(layer().with_target(false).with_filter(
            EnvFilter::builder()
                .with_env_var(LOGGING_ENV)
                .try_from_env()
                .unwrap_or_else(|_| "pyboot=info".into()),
        ))
        .with(file_layer)
        .try_init()
        .context("error while initializing the logging")
}

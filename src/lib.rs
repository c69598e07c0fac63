use color_eyre::eyre::WrapErr;
pub use color_eyre::eyre::{Error, Result};

use crate::cli::LogFormat;

pub mod cache;
pub mod checksum;
pub mod chunking;
pub mod cli;
pub mod collections;
pub mod config;
pub mod error;
pub mod hlc;
pub mod mqtt;
pub mod queue;
pub mod rpc;

pub fn bootstrap(log_format: LogFormat) -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Don't die if the file doesn't exist.
        if !e.not_found() {
            return Err(e).context("error reading `.env` file");
        }
    }

    // Enables capturing backtraces on stable
    color_eyre::install()?;

    match log_format {
        LogFormat::Full => {
            tracing_subscriber::fmt::try_init().map_err(|e| color_eyre::eyre::eyre!(e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt().compact().try_init().map_err(|e| color_eyre::eyre::eyre!(e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().pretty().try_init().map_err(|e| color_eyre::eyre::eyre!(e))?;
        }
        LogFormat::Json => tracing_subscriber::fmt().json().try_init().map_err(|e| color_eyre::eyre::eyre!(e))?,
    }

    Ok(())
}

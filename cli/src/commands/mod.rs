pub mod run;
pub mod schedule;
pub mod validate;

use anyhow::{Context, Result};
use tierdump_core::Config;

/// Loads and validates the configuration named on the command line, then
/// starts logging with its settings.
pub(crate) fn load_config(cli: &crate::Cli) -> Result<Config> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config
        .validate()
        .with_context(|| format!("Configuration validation failed for {}", cli.config.display()))?;

    crate::init_tracing(config.log_level(), config.log_format(), cli.verbose, cli.quiet)?;
    Ok(config)
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that only need the configuration
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("tsquery Configuration:");
            println!("======================");
            println!("Default step: {:?}", config.query.default_step);
            println!("Lookback delta: {:?}", config.query.lookback_delta);
            println!("Default storage: {}", config.query.default_storage_id);
            println!("Archive storage: {}", config.query.archive_storage_id);
            println!("Align windowed results: {}", config.query.align_result);
            println!("Catalog tables: {}", config.catalog.tables.len());
            println!("Catalog proxies: {}", config.catalog.proxies.len());
            println!("Archived shards: {}", config.catalog.archives.len());
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if config.query.default_step.is_zero() {
            anyhow::bail!("Default step must be greater than zero");
        }

        if config.query.archive_storage_id.is_empty() {
            anyhow::bail!("Archive storage id cannot be empty");
        }

        for table in &config.catalog.tables {
            if table.table_id.is_empty() {
                anyhow::bail!("Catalog table in space '{}' has no table id", table.space_uid);
            }
            if !config
                .catalog
                .proxies
                .iter()
                .any(|proxy| proxy.table_id == table.table_id)
            {
                log::warn!("Table {} has no proxy and will never resolve", table.table_id);
            }
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that only inspect the configuration
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, TableConfig};

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_validate_default_config() {
        assert!(utils::validate_config(&Configuration::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_step() {
        let mut config = Configuration::default();
        config.query.default_step = std::time::Duration::ZERO;
        assert!(utils::validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_anonymous_table() {
        let mut config = Configuration::default();
        config.catalog.tables.push(TableConfig {
            space_uid: "bkcc__2".to_string(),
            ..Default::default()
        });
        assert!(utils::validate_config(&config).is_err());
    }
}

//! Command-line interface.

pub mod doctor;

use clap::{Parser, Subcommand};

use palaver_bus::EventBus;
use palaver_domain::config::Config;

use crate::config_service::ConfigService;

#[derive(Debug, Parser)]
#[command(name = "palaver", about = "Multi-user conversational agent gateway")]
pub struct Cli {
    /// Config directory (holds default.json and users/).
    #[arg(long, default_value = "config")]
    pub config_dir: std::path::PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP server (the default).
    Serve,
    /// Run environment checks and exit non-zero on failure.
    Doctor,
    /// Config inspection.
    Config(ConfigArgs),
    /// Print the version.
    Version,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the merged configuration.
    Validate,
    /// Print the merged configuration (secrets redacted).
    Show,
}

/// Load the layered config the same way the server does; standalone
/// commands get a throwaway bus.
pub fn load_config(config_dir: std::path::PathBuf) -> anyhow::Result<(Config, ConfigService)> {
    let bus = std::sync::Arc::new(EventBus::new());
    let service = ConfigService::load(config_dir, bus)?;
    let config = service.snapshot().config.clone();
    Ok((config, service))
}

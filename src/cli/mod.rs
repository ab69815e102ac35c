//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the dispatcher
//! - `config show|path` -- inspect configuration
//! - `resolve` -- dry-run a message through the router
//! - `version` -- print version info

use clap::{Parser, Subcommand};

use crate::config;

/// OneBot v11 WebSocket command dispatcher.
#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    version = env!("CARGO_PKG_VERSION"),
    about = "switchboard — routes chat commands from OneBot frontends to upstream bot backends"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the dispatcher (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Dry-run a message through the router and print the decision.
    Resolve {
        /// The message text to resolve.
        text: String,

        /// Sender qq id.
        #[arg(short, long)]
        user: i64,

        /// Group id, for group-message resolution.
        #[arg(short, long)]
        group: Option<i64>,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the parsed configuration as JSON.
    Show,
    /// Print the config file path.
    Path,
}

/// Handle `config show`.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Handle `config path`.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Handle `version`.
pub fn handle_version() {
    println!("switchboard {}", env!("CARGO_PKG_VERSION"));
}

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

pub mod config_cmd;
pub mod serve;

/// Supervises a fleet of chat-bot worker processes.
#[derive(Debug, Parser)]
#[command(name = "herd", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve JSON-lines requests from stdin, one response per line on stdout.
    Serve(ConfigArgs),
    /// Print the effective configuration as TOML.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct ConfigArgs {
    /// TOML configuration file. Defaults apply when it does not exist.
    #[arg(long = "config", value_name = "FILE", default_value = "herd.toml")]
    pub config: PathBuf,
}

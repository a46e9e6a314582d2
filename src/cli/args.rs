//! CLI argument definitions using clap
//!
//! Commands:
//! - chaos-cell init --config <path>
//! - chaos-cell serve --config <path>
//! - chaos-cell inspect --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// chaos-cell - replication card coordinator for chaos replicated tables
#[derive(Parser, Debug)]
#[command(name = "chaos-cell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the data directory of a new cell
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./chaos-cell.json")]
        config: PathBuf,
    },

    /// Restore the cell and serve JSON requests from stdin
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./chaos-cell.json")]
        config: PathBuf,
    },

    /// Print the persisted cell state and exit
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./chaos-cell.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["chaos-cell", "serve"]).unwrap();
        match cli.command {
            Command::Serve { config } => assert_eq!(config, PathBuf::from("./chaos-cell.json")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_explicit_config_path() {
        let cli = Cli::try_parse_from(["chaos-cell", "inspect", "--config", "/etc/cell.json"]).unwrap();
        assert!(matches!(cli.command, Command::Inspect { config } if config == PathBuf::from("/etc/cell.json")));
    }
}

//! Tether CLI - run and inspect guest modules from the command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tether_core::BridgeConfig;
use tracing_subscriber::EnvFilter;

mod commands;

/// Tether guest-module bridge
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, global = true, default_value = "human")]
    pub format: OutputFormat,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Output format options.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON output
    Json,
    /// Compact JSON (single line)
    JsonCompact,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Load a module and call its `run` export
    Run(commands::run::RunArgs),
    /// Load a module and call one export with JSON arguments
    Call(commands::call::CallArgs),
    /// Inspect a module's exports, imports and ABI fitness
    Inspect(commands::inspect::InspectArgs),
}

/// Read the bridge configuration, or the defaults when no file is given.
fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tether={log_level},tether_core={log_level},tether_host={log_level},tether_observe={log_level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Run(args) => commands::run::execute(args, config, cli.format, cli.quiet),
        Commands::Call(args) => commands::call::execute(args, config, cli.format, cli.quiet),
        Commands::Inspect(args) => commands::inspect::execute(args, config, cli.format),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !cli.quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_call() {
        let cli = Cli::try_parse_from(["tether", "-vv", "call", "plugin.wasm", "add", "--", "2", "3"])
            .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.function, "add");
                assert_eq!(args.args, vec!["2", "3"]);
            }
            _ => panic!("expected the call command"),
        }
    }

    #[test]
    fn test_default_config_without_file() {
        assert_eq!(load_config(None).unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(Some(Path::new("/nonexistent/tether.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}

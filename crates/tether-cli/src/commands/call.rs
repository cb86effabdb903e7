//! Call command - load a module and call one export.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tether_core::BridgeConfig;

use super::convert::parse_arg;
use super::{ExecArgs, call_and_report};
use crate::OutputFormat;

/// Arguments for the call command.
#[derive(Args)]
pub struct CallArgs {
    /// Path to the WebAssembly module
    #[arg(required = true)]
    pub module: PathBuf,

    /// Exact name of the export to call
    #[arg(required = true)]
    pub function: String,

    /// Arguments, one JSON value each; anything else is passed as a string
    #[arg(last = true)]
    pub args: Vec<String>,

    #[command(flatten)]
    pub exec: ExecArgs,
}

/// Execute the call command.
pub fn execute(args: CallArgs, config: BridgeConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    let values = args.args.iter().map(|raw| parse_arg(raw)).collect();
    call_and_report(
        &args.module,
        Some(&args.function),
        values,
        config,
        &args.exec,
        format,
        quiet,
    )
}

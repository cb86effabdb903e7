//! Run command - load a module and call its `run` export.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tether_core::BridgeConfig;

use super::{ExecArgs, call_and_report};
use crate::OutputFormat;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Path to the WebAssembly module
    #[arg(required = true)]
    pub module: PathBuf,

    #[command(flatten)]
    pub exec: ExecArgs,
}

/// Execute the run command.
pub fn execute(args: RunArgs, config: BridgeConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    call_and_report(&args.module, None, Vec::new(), config, &args.exec, format, quiet)
}

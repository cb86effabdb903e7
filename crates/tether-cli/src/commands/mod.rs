//! Command implementations.

pub mod call;
pub mod convert;
pub mod inspect;
pub mod run;

use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tether::prelude::*;

use crate::OutputFormat;

/// Limits shared by the commands that execute guest code.
#[derive(Args, Debug, Default)]
pub struct ExecArgs {
    /// Memory limit per instance in bytes (overrides the config file)
    #[arg(long)]
    pub memory_limit: Option<usize>,

    /// Fuel granted to the call; enables fuel metering
    #[arg(long)]
    pub fuel_limit: Option<u64>,

    /// Interrupt the call after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Include bridge events in the output
    #[arg(long)]
    pub events: bool,
}

/// What one call produced.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Success { result: Value },
    Failed { kind: String, message: String },
}

/// Report printed after a call.
#[derive(Debug, Serialize)]
struct CallReport {
    module: String,
    instance_id: u32,
    function: String,
    duration_us: u64,
    #[serde(flatten)]
    outcome: Outcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<BridgeEvent>,
}

fn build_runtime(
    config: BridgeConfig,
    exec: &ExecArgs,
    collector: Option<Arc<CollectingSubscriber>>,
) -> Result<TetherRuntime> {
    let mut builder = Tether::builder().with_config(config).with_event_logging();

    if let Some(bytes) = exec.memory_limit {
        builder = builder.with_memory_limit(bytes);
    }
    if let Some(fuel) = exec.fuel_limit {
        builder = builder.with_fuel_limit(fuel);
    }
    if let Some(collector) = collector {
        builder = builder.with_event_subscriber(collector);
    }

    builder.build().context("Failed to create runtime")
}

/// Interrupt the runtime once `timeout` passes, unless the returned sender
/// is dropped first.
fn start_watchdog(handle: InterruptHandle, timeout: Duration) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (done, finished) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || {
        if let Err(mpsc::RecvTimeoutError::Timeout) = finished.recv_timeout(timeout) {
            tracing::warn!(timeout = ?timeout, "Call timed out, interrupting guest");
            handle.interrupt();
        }
    });
    (done, watchdog)
}

/// Load a module, call one export (or `run`), and print the outcome.
pub(crate) fn call_and_report(
    module: &Path,
    function: Option<&str>,
    args: Vec<DynamicValue>,
    config: BridgeConfig,
    exec: &ExecArgs,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let collector = exec.events.then(|| Arc::new(CollectingSubscriber::new(1024)));
    if exec.timeout.is_some() && !config.engine.epoch_enabled {
        tracing::warn!("Interrupts are disabled in the configuration; --timeout has no effect");
    }
    let runtime = build_runtime(config, exec, collector.clone())?;

    let id = runtime
        .load_file(module)
        .with_context(|| format!("Failed to load module {}", module.display()))?;
    let function_name = function.unwrap_or("run");

    if !quiet {
        tracing::info!(
            module = %module.display(),
            instance_id = %id,
            function = function_name,
            args = args.len(),
            "Calling guest"
        );
    }

    let watchdog = exec
        .timeout
        .map(|secs| start_watchdog(runtime.interrupt_handle(), Duration::from_secs(secs)));

    let started = Instant::now();
    let result = match function {
        Some(function) => runtime.call(id, function, &args),
        None => runtime.run(id),
    };
    let duration = started.elapsed();

    if let Some((done, watchdog)) = watchdog {
        drop(done);
        watchdog
            .join()
            .map_err(|_| anyhow!("Timeout watchdog panicked"))?;
    }

    let outcome = match &result {
        Ok(value) => Outcome::Success {
            result: convert::value_to_json(value),
        },
        Err(e) => Outcome::Failed {
            kind: e.kind().to_string(),
            message: e.to_string(),
        },
    };
    let report = CallReport {
        module: module.display().to_string(),
        instance_id: id.get(),
        function: function_name.to_string(),
        duration_us: duration.as_micros() as u64,
        outcome,
        events: collector
            .map(|c| c.events().into_iter().map(|(_, event)| event).collect())
            .unwrap_or_default(),
    };

    match format {
        OutputFormat::Human => {
            if let Outcome::Success { result } = &report.outcome {
                println!("{result}");
                if !quiet {
                    eprintln!("Completed {function_name} in {duration:?}");
                }
            }
            for event in &report.events {
                println!("  event: {}", serde_json::to_string(event)?);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::JsonCompact => println!("{}", serde_json::to_string(&report)?),
    }

    match report.outcome {
        Outcome::Success { .. } => Ok(()),
        Outcome::Failed { kind, message } => {
            Err(anyhow!("{function_name} failed ({kind}): {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serialization() {
        let report = CallReport {
            module: "plugin.wasm".to_string(),
            instance_id: 0,
            function: "run".to_string(),
            duration_us: 12,
            outcome: Outcome::Failed {
                kind: "trap".to_string(),
                message: "wasm trap: unreachable".to_string(),
            },
            events: Vec::new(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "trap");
        assert!(json.get("events").is_none());
    }

    #[test]
    fn test_watchdog_stands_down() {
        let runtime = Tether::with_defaults().unwrap();
        let collector = Arc::new(CollectingSubscriber::new(8));
        runtime
            .event_dispatcher()
            .subscribe(Arc::clone(&collector) as Arc<dyn EventSubscriber>);

        let (done, watchdog) = start_watchdog(runtime.interrupt_handle(), Duration::from_secs(60));
        drop(done);
        watchdog.join().unwrap();

        assert!(collector.is_empty());
    }
}

//! Inspect command - show what a module exports and imports, and whether
//! the bridge can call it.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use tether::Tether;
use tether_core::{BridgeConfig, ExportInfo, ExportKind, ImportInfo, ImportKind, ModuleMetadata};

use crate::OutputFormat;

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// Path to the WebAssembly module
    #[arg(required = true)]
    pub module: PathBuf,

    /// Show exports
    #[arg(long)]
    pub exports: bool,

    /// Show imports
    #[arg(long)]
    pub imports: bool,

    /// Show memory information
    #[arg(long)]
    pub memory: bool,

    /// Show all information
    #[arg(long, short)]
    pub all: bool,

    /// Fail if the module does not follow the guest ABI
    #[arg(long)]
    pub check: bool,
}

/// Inspection result.
#[derive(Debug, Serialize)]
struct InspectionResult {
    path: String,
    name: Option<String>,
    callable: Vec<String>,
    abi_issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exports: Option<Vec<ExportDisplay>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    imports: Option<Vec<ImportDisplay>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memories: Option<Vec<MemoryDisplay>>,
}

#[derive(Debug, Serialize)]
struct ExportDisplay {
    name: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImportDisplay {
    module: String,
    name: String,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct MemoryDisplay {
    min_pages: u64,
    max_pages: Option<u64>,
    memory64: bool,
}

impl From<&ExportInfo> for ExportDisplay {
    fn from(info: &ExportInfo) -> Self {
        let (kind, signature) = match &info.kind {
            ExportKind::Function { signature, .. } => ("function", Some(signature.clone())),
            ExportKind::Memory => ("memory", None),
            ExportKind::Global => ("global", None),
            ExportKind::Table => ("table", None),
            ExportKind::Other => ("other", None),
        };

        Self {
            name: info.name.clone(),
            kind: kind.to_string(),
            signature,
        }
    }
}

impl From<&ImportInfo> for ImportDisplay {
    fn from(info: &ImportInfo) -> Self {
        let (kind, signature) = match &info.kind {
            ImportKind::Function { signature } => ("function", Some(signature.clone())),
            ImportKind::Memory => ("memory", None),
            ImportKind::Global => ("global", None),
            ImportKind::Table => ("table", None),
            ImportKind::Other => ("other", None),
        };

        Self {
            module: info.module.clone(),
            name: info.name.clone(),
            kind: kind.to_string(),
            signature,
        }
    }
}

fn inspect(path: String, metadata: &ModuleMetadata, args: &InspectArgs) -> InspectionResult {
    let show_all = args.all || (!args.exports && !args.imports && !args.memory);

    InspectionResult {
        path,
        name: metadata.name.clone(),
        callable: metadata
            .callable_functions()
            .map(|e| e.name.clone())
            .collect(),
        abi_issues: metadata.abi_issues(),
        exports: (show_all || args.exports)
            .then(|| metadata.exports.iter().map(ExportDisplay::from).collect()),
        imports: (show_all || args.imports)
            .then(|| metadata.imports.iter().map(ImportDisplay::from).collect()),
        memories: (show_all || args.memory).then(|| {
            metadata
                .memories
                .iter()
                .map(|m| MemoryDisplay {
                    min_pages: m.min_pages,
                    max_pages: m.max_pages,
                    memory64: m.memory64,
                })
                .collect()
        }),
    }
}

/// Execute the inspect command.
pub fn execute(args: InspectArgs, config: BridgeConfig, format: OutputFormat) -> Result<()> {
    let runtime = Tether::builder()
        .with_config(config)
        .build()
        .context("Failed to create runtime")?;

    let bytes = std::fs::read(&args.module)
        .with_context(|| format!("Failed to read {}", args.module.display()))?;
    let module = runtime
        .compile(&bytes)
        .with_context(|| format!("Failed to compile {}", args.module.display()))?;

    let result = inspect(args.module.display().to_string(), module.metadata(), &args);

    // Output results
    match format {
        OutputFormat::Human => {
            println!("Module: {}", result.path);
            if let Some(name) = &result.name {
                println!("Name: {name}");
            }
            println!();

            println!("Callable ({}):", result.callable.len());
            for name in &result.callable {
                println!("  {name}");
            }
            println!();

            if let Some(exports) = &result.exports {
                println!("Exports ({}):", exports.len());
                for export in exports {
                    if let Some(sig) = &export.signature {
                        println!("  {} [{}]: {}", export.name, export.kind, sig);
                    } else {
                        println!("  {} [{}]", export.name, export.kind);
                    }
                }
                println!();
            }

            if let Some(imports) = &result.imports {
                println!("Imports ({}):", imports.len());
                for import in imports {
                    if let Some(sig) = &import.signature {
                        println!(
                            "  {}::{} [{}]: {}",
                            import.module, import.name, import.kind, sig
                        );
                    } else {
                        println!("  {}::{} [{}]", import.module, import.name, import.kind);
                    }
                }
                println!();
            }

            if let Some(memories) = &result.memories {
                println!("Memories ({}):", memories.len());
                for (i, memory) in memories.iter().enumerate() {
                    let max = memory
                        .max_pages
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "unbounded".to_string());
                    let bits = if memory.memory64 { "64-bit" } else { "32-bit" };
                    println!("  [{}] {} - {} pages ({})", i, memory.min_pages, max, bits);
                }
                println!();
            }

            if result.abi_issues.is_empty() {
                println!("ABI: ok");
            } else {
                println!("ABI issues ({}):", result.abi_issues.len());
                for issue in &result.abi_issues {
                    println!("  - {issue}");
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::JsonCompact => {
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    if args.check && !result.abi_issues.is_empty() {
        bail!(
            "{} does not follow the guest ABI ({} issues)",
            result.path,
            result.abi_issues.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(exports: bool) -> InspectArgs {
        InspectArgs {
            module: PathBuf::from("guest.wasm"),
            exports,
            imports: false,
            memory: false,
            all: false,
            check: true,
        }
    }

    #[test]
    fn test_inspect_reports_callable_exports() {
        let runtime = Tether::with_defaults().unwrap();
        let wasm = runtime
            .compile(
                br#"(module
                    (memory (export "memory") 1)
                    (func (export "alloc") (param i32) (result i32) (local.get 0))
                    (func (export "greet") (param i64) (result i64) (local.get 0))
                    (func (export "narrow") (param i32)))"#,
            )
            .unwrap();

        let result = inspect("guest.wasm".into(), wasm.metadata(), &args(true));

        assert_eq!(result.callable, vec!["greet"]);
        assert_eq!(result.abi_issues.len(), 1);
        assert!(result.abi_issues[0].contains("narrow"));
        assert!(result.exports.is_some());
        assert!(result.imports.is_none());
    }

    #[test]
    fn test_inspect_flags_foreign_imports() {
        let runtime = Tether::with_defaults().unwrap();
        let wasm = runtime
            .compile(br#"(module (import "env" "print" (func (param i32))))"#)
            .unwrap();

        let result = inspect("guest.wasm".into(), wasm.metadata(), &args(false));

        assert!(result.callable.is_empty());
        assert!(result.abi_issues.iter().any(|i| i.contains("env::print")));
        assert!(result.exports.is_some());
        assert!(result.imports.is_some());
    }
}

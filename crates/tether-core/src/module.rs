//! Module compilation and inspection.
//!
//! [`ModuleLoader`] compiles module bytes once and records what the module
//! exports and imports, so the host backend can reject exports whose
//! signature does not fit the bridge before running any guest code, and the
//! CLI can show how well a module follows the guest ABI.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{ExternType, FuncType, Module, ValType};

use crate::backend::{
    ALLOC_EXPORT, CALLBACK_EXPORT, DROP_CALLBACK_EXPORT, HOST_IMPORTS, HOST_MODULE, MEMORY_EXPORT,
};
use crate::engine::TetherEngine;
use crate::error::{LoadError, LoadResult};

/// A compiled module with its metadata.
#[derive(Clone)]
pub struct ValidatedModule {
    inner: Module,
    metadata: ModuleMetadata,
}

impl ValidatedModule {
    /// Get a reference to the underlying Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Get the module metadata.
    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Get the module name, if set.
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    /// Get the list of exports.
    pub fn exports(&self) -> &[ExportInfo] {
        &self.metadata.exports
    }

    /// Get the list of imports.
    pub fn imports(&self) -> &[ImportInfo] {
        &self.metadata.imports
    }

    /// Check if the module has a specific export.
    pub fn has_export(&self, name: &str) -> bool {
        self.metadata.export(name).is_some()
    }

    /// Check if the module requires a specific import.
    pub fn requires_import(&self, module: &str, name: &str) -> bool {
        self.metadata
            .imports
            .iter()
            .any(|i| i.module == module && i.name == name)
    }
}

impl std::fmt::Debug for ValidatedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedModule")
            .field("name", &self.metadata.name)
            .field("exports", &self.metadata.exports.len())
            .field("imports", &self.metadata.imports.len())
            .finish()
    }
}

/// Metadata extracted from a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    /// Module name, if specified.
    pub name: Option<String>,
    /// List of exported items.
    pub exports: Vec<ExportInfo>,
    /// List of required imports.
    pub imports: Vec<ImportInfo>,
    /// Exported memories.
    pub memories: Vec<MemoryInfo>,
}

impl ModuleMetadata {
    /// Look up an export by exact name.
    pub fn export(&self, name: &str) -> Option<&ExportInfo> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Function exports the bridge can call with dynamic values.
    pub fn callable_functions(&self) -> impl Iterator<Item = &ExportInfo> {
        self.exports.iter().filter(|e| {
            matches!(e.kind, ExportKind::Function { callable: true, .. })
                && !is_reserved_export(&e.name)
        })
    }

    /// Describe every way the module departs from the guest ABI.
    ///
    /// An empty list means every function export can be called through the
    /// bridge and every import can be satisfied by the host.
    pub fn abi_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.export(MEMORY_EXPORT).is_none() {
            issues.push(format!("no '{MEMORY_EXPORT}' export; values cannot be exchanged"));
        }
        match self.export(ALLOC_EXPORT).map(|e| &e.kind) {
            None => issues.push(format!(
                "no '{ALLOC_EXPORT}' export; the host cannot pass arguments"
            )),
            Some(ExportKind::Function { signature, .. }) if signature != "(i32) -> (i32)" => {
                issues.push(format!(
                    "'{ALLOC_EXPORT}' has signature {signature}, expected (i32) -> (i32)"
                ));
            }
            Some(_) => {}
        }

        for export in &self.exports {
            if let ExportKind::Function {
                callable: false,
                signature,
                ..
            } = &export.kind
            {
                if !is_reserved_export(&export.name) {
                    issues.push(format!(
                        "export '{}' has signature {signature}; callable exports take i64 \
                         arguments and return at most one i64",
                        export.name
                    ));
                }
            }
        }

        for import in &self.imports {
            if import.module != HOST_MODULE {
                issues.push(format!(
                    "import '{}::{}' is not provided by the host",
                    import.module, import.name
                ));
            } else if !HOST_IMPORTS.contains(&import.name.as_str()) {
                issues.push(format!("unknown host import '{HOST_MODULE}::{}'", import.name));
            }
        }

        issues
    }
}

fn is_reserved_export(name: &str) -> bool {
    name == ALLOC_EXPORT || name == DROP_CALLBACK_EXPORT || name == CALLBACK_EXPORT
}

/// Information about an exported item.
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Export name.
    pub name: String,
    /// Type of the export.
    pub kind: ExportKind,
}

/// The kind of an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    /// A function export.
    Function {
        /// Number of parameters.
        params: usize,
        /// Number of results.
        results: usize,
        /// Signature in `(params) -> (results)` form.
        signature: String,
        /// Whether the bridge can call it with packed values.
        callable: bool,
    },
    /// A memory export.
    Memory,
    /// A global export.
    Global,
    /// A table export.
    Table,
    /// Any other extern.
    Other,
}

/// Information about a required import.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    /// Import module name.
    pub module: String,
    /// Import name.
    pub name: String,
    /// Type of the import.
    pub kind: ImportKind,
}

/// The kind of an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    /// A function import.
    Function {
        /// Signature in `(params) -> (results)` form.
        signature: String,
    },
    /// A memory import.
    Memory,
    /// A global import.
    Global,
    /// A table import.
    Table,
    /// Any other extern.
    Other,
}

/// Information about a memory definition.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Minimum memory size in pages (64KB each).
    pub min_pages: u64,
    /// Maximum memory size in pages, if specified.
    pub max_pages: Option<u64>,
    /// Whether this is a 64-bit memory.
    pub memory64: bool,
}

/// Loader for guest modules.
pub struct ModuleLoader {
    engine: Arc<TetherEngine>,
}

impl ModuleLoader {
    /// Create a new module loader with the given engine.
    pub fn new(engine: Arc<TetherEngine>) -> Self {
        Self { engine }
    }

    /// Compile a module from binary or text bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::InvalidModule`] with the engine's diagnostic
    /// if the bytes do not compile.
    pub fn load_bytes(&self, bytes: &[u8]) -> LoadResult<ValidatedModule> {
        debug!(size = bytes.len(), "Compiling module from bytes");

        let module = Module::new(self.engine.inner(), bytes)
            .map_err(|e| LoadError::InvalidModule(format!("{e:?}")))?;
        let metadata = extract_metadata(&module);

        info!(
            name = ?metadata.name,
            exports = metadata.exports.len(),
            imports = metadata.imports.len(),
            "Compiled module"
        );

        Ok(ValidatedModule {
            inner: module,
            metadata,
        })
    }

    /// Compile a module from a file.
    pub fn load_file(&self, path: &Path) -> LoadResult<ValidatedModule> {
        debug!(path = %path.display(), "Compiling module from file");

        let bytes = std::fs::read(path).map_err(|e| {
            LoadError::InvalidModule(format!("cannot read {}: {e}", path.display()))
        })?;
        self.load_bytes(&bytes)
    }

    /// Compile a module from WebAssembly text.
    pub fn load_wat(&self, wat: &str) -> LoadResult<ValidatedModule> {
        debug!(size = wat.len(), "Compiling module from WAT");

        let wasm = wat::parse_str(wat).map_err(|e| LoadError::InvalidModule(e.to_string()))?;
        self.load_bytes(&wasm)
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("engine", &self.engine)
            .finish()
    }
}

/// Render a function type as `(i64, i64) -> (i64)`.
pub fn format_signature(ty: &FuncType) -> String {
    format!(
        "({}) -> ({})",
        join_types(ty.params()),
        join_types(ty.results())
    )
}

fn join_types(types: impl Iterator<Item = ValType>) -> String {
    types.map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

/// Check whether the bridge can call a function with packed values: every
/// parameter is an `i64` and the result is nothing or one `i64`.
pub fn is_bridge_callable(ty: &FuncType) -> bool {
    ty.params().all(|t| matches!(t, ValType::I64))
        && ty.results().len() <= 1
        && ty.results().all(|t| matches!(t, ValType::I64))
}

fn extract_metadata(module: &Module) -> ModuleMetadata {
    let name = module.name().map(String::from);

    let exports = module
        .exports()
        .map(|export| ExportInfo {
            name: export.name().to_string(),
            kind: export_kind(export.ty()),
        })
        .collect();

    let imports = module
        .imports()
        .map(|import| ImportInfo {
            module: import.module().to_string(),
            name: import.name().to_string(),
            kind: import_kind(import.ty()),
        })
        .collect();

    let memories = module
        .exports()
        .filter_map(|export| match export.ty() {
            ExternType::Memory(mem) => Some(MemoryInfo {
                min_pages: mem.minimum(),
                max_pages: mem.maximum(),
                memory64: mem.is_64(),
            }),
            _ => None,
        })
        .collect();

    ModuleMetadata {
        name,
        exports,
        imports,
        memories,
    }
}

fn export_kind(ty: ExternType) -> ExportKind {
    match ty {
        ExternType::Func(func) => ExportKind::Function {
            params: func.params().len(),
            results: func.results().len(),
            signature: format_signature(&func),
            callable: is_bridge_callable(&func),
        },
        ExternType::Memory(_) => ExportKind::Memory,
        ExternType::Global(_) => ExportKind::Global,
        ExternType::Table(_) => ExportKind::Table,
        _ => ExportKind::Other,
    }
}

fn import_kind(ty: ExternType) -> ImportKind {
    match ty {
        ExternType::Func(func) => ImportKind::Function {
            signature: format_signature(&func),
        },
        ExternType::Memory(_) => ImportKind::Memory,
        ExternType::Global(_) => ImportKind::Global,
        ExternType::Table(_) => ImportKind::Table,
        _ => ImportKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn create_loader() -> ModuleLoader {
        let engine = Arc::new(TetherEngine::new(EngineConfig::default()).unwrap());
        ModuleLoader::new(engine)
    }

    #[test]
    fn test_bridge_compatible_module() {
        let module = create_loader()
            .load_wat(
                r#"
            (module
                (import "tether" "log" (func (param i32 i32 i32)))
                (memory (export "memory") 1 10)
                (func (export "alloc") (param i32) (result i32) i32.const 1024)
                (func (export "add") (param i64 i64) (result i64) i64.const 0)
                (func (export "run"))
            )
        "#,
            )
            .unwrap();

        assert!(module.has_export("add"));
        assert!(module.requires_import("tether", "log"));
        assert_eq!(module.metadata().memories[0].max_pages, Some(10));

        let callable: Vec<_> = module
            .metadata()
            .callable_functions()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(callable, vec!["add", "run"]);
        assert!(module.metadata().abi_issues().is_empty());

        let add = module.metadata().export("add").unwrap();
        assert!(matches!(
            &add.kind,
            ExportKind::Function { params: 2, results: 1, signature, callable: true }
                if signature == "(i64, i64) -> (i64)"
        ));
    }

    #[test]
    fn test_abi_issues_are_reported() {
        let module = create_loader()
            .load_wat(
                r#"
            (module
                (import "env" "print" (func (param i32)))
                (import "tether" "spawn" (func))
                (func (export "double") (param i32) (result i32)
                    local.get 0
                    i32.const 2
                    i32.mul
                )
            )
        "#,
            )
            .unwrap();

        let issues = module.metadata().abi_issues();
        assert_eq!(issues.len(), 5, "{issues:#?}");
        assert!(issues.iter().any(|i| i.contains("'double' has signature (i32) -> (i32)")));
        assert!(issues.iter().any(|i| i.contains("env::print")));
        assert!(issues.iter().any(|i| i.contains("tether::spawn")));
        assert_eq!(module.metadata().callable_functions().count(), 0);
    }

    #[test]
    fn test_load_invalid_module() {
        let loader = create_loader();

        assert!(matches!(
            loader.load_bytes(&[0, 1, 2, 3]),
            Err(LoadError::InvalidModule(_))
        ));
        assert!(matches!(
            loader.load_wat("(module (func (export \"f\") i32.add))"),
            Err(LoadError::InvalidModule(_))
        ));
        assert!(matches!(
            loader.load_file(Path::new("/nonexistent/guest.wasm")),
            Err(LoadError::InvalidModule(msg)) if msg.contains("cannot read")
        ));
    }
}

//! Configuration types for the Tether bridge.
//!
//! All structures deserialize from TOML or JSON with every field optional,
//! so a configuration file only needs to name what it changes:
//!
//! ```toml
//! max_depth = 32
//!
//! [engine]
//! debug_info = true
//!
//! [limits]
//! fuel_per_call = 5_000_000
//! ```

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_DEPTH;

/// Configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Enable fuel-based CPU limiting.
    ///
    /// When enabled, every call is given [`ResourceLimits::fuel_per_call`]
    /// units and fails with `Cancelled` when they run out.
    pub fuel_enabled: bool,

    /// Enable epoch-based interruption.
    ///
    /// Required for [`interrupt`](crate::Dispatcher::interrupt) to stop a
    /// running guest.
    pub epoch_enabled: bool,

    /// Maximum WASM stack size in bytes.
    ///
    /// Defaults to 1MB.
    pub max_wasm_stack: usize,

    /// Enable debug information in compiled code, for better backtraces.
    pub debug_info: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fuel_enabled: false,
            epoch_enabled: true,
            max_wasm_stack: 1024 * 1024, // 1MB
            debug_info: false,
        }
    }
}

impl EngineConfig {
    /// Create a new engine configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable fuel-based CPU limiting.
    pub fn with_fuel(mut self, enabled: bool) -> Self {
        self.fuel_enabled = enabled;
        self
    }

    /// Enable epoch-based interruption.
    pub fn with_epochs(mut self, enabled: bool) -> Self {
        self.epoch_enabled = enabled;
        self
    }

    /// Set the maximum WASM stack size.
    pub fn with_max_wasm_stack(mut self, bytes: usize) -> Self {
        self.max_wasm_stack = bytes;
        self
    }

    /// Enable debug information.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }
}

/// Resource limits applied to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum linear memory per instance in bytes.
    ///
    /// Defaults to 64MB.
    pub max_memory_bytes: usize,

    /// Maximum table elements per instance.
    pub max_table_elements: u32,

    /// Fuel granted to each call when fuel is enabled.
    pub fuel_per_call: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
            max_table_elements: 10_000,
            fuel_per_call: 1_000_000_000,
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum memory limit.
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the maximum number of table elements.
    pub fn with_max_table_elements(mut self, elements: u32) -> Self {
        self.max_table_elements = elements;
        self
    }

    /// Set the fuel granted to each call.
    pub fn with_fuel_per_call(mut self, fuel: u64) -> Self {
        self.fuel_per_call = fuel;
        self
    }

    /// Small limits for tests and untrusted snippets.
    pub fn minimal() -> Self {
        Self {
            max_memory_bytes: 1024 * 1024, // 1MB
            max_table_elements: 1_000,
            fuel_per_call: 100_000,
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Per-instance limits.
    pub limits: ResourceLimits,
    /// Container nesting limit for encoding and decoding values.
    pub max_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            limits: ResourceLimits::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the nesting limit.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new()
            .with_fuel(true)
            .with_debug_info(true)
            .with_max_wasm_stack(2 * 1024 * 1024);

        assert!(config.fuel_enabled);
        assert!(config.epoch_enabled);
        assert!(config.debug_info);
        assert_eq!(config.max_wasm_stack, 2 * 1024 * 1024);
    }

    #[test]
    fn test_bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert!(!config.engine.fuel_enabled);
        assert!(ResourceLimits::minimal().fuel_per_call < config.limits.fuel_per_call);
    }

    #[test]
    fn test_partial_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            max_depth = 16

            [limits]
            fuel_per_call = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.max_depth, 16);
        assert_eq!(config.limits.fuel_per_call, 500);
        assert_eq!(config.limits.max_table_elements, 10_000);
        assert_eq!(config.engine, EngineConfig::default());
    }
}

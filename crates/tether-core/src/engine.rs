//! Wasmtime engine wrapper.
//!
//! [`TetherEngine`] owns the shared `wasmtime::Engine` every instance is
//! compiled with, and the epoch counter used to interrupt running guests.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};
use wasmtime::{Config, Engine};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// The shared Wasmtime engine.
///
/// # Example
///
/// ```
/// use tether_core::{EngineConfig, TetherEngine};
///
/// let engine = TetherEngine::new(EngineConfig::default()).unwrap();
/// assert!(engine.epoch_enabled());
/// ```
pub struct TetherEngine {
    inner: Engine,
    config: EngineConfig,
    epoch: RwLock<u64>,
}

impl TetherEngine {
    /// Create an engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        if config.max_wasm_stack == 0 {
            return Err(EngineError::InvalidConfig(
                "max_wasm_stack must be greater than zero".to_string(),
            ));
        }

        let mut wasmtime_config = Config::new();
        wasmtime_config.consume_fuel(config.fuel_enabled);
        wasmtime_config.epoch_interruption(config.epoch_enabled);
        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        wasmtime_config.debug_info(config.debug_info);
        wasmtime_config.wasm_backtrace(true);
        wasmtime_config.wasm_bulk_memory(true);
        wasmtime_config.wasm_multi_value(true);

        let inner = Engine::new(&wasmtime_config)?;

        info!(
            fuel = config.fuel_enabled,
            epochs = config.epoch_enabled,
            max_wasm_stack = config.max_wasm_stack,
            "Created Tether engine"
        );

        Ok(Self {
            inner,
            config,
            epoch: RwLock::new(0),
        })
    }

    /// Create an engine with the default configuration.
    pub fn default_engine() -> EngineResult<Self> {
        Self::new(EngineConfig::default())
    }

    /// The underlying Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.inner
    }

    /// The configuration this engine was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the epoch.
    ///
    /// Every store arms a deadline of one epoch before each call, so a
    /// single increment interrupts whatever guest code is running.
    pub fn increment_epoch(&self) {
        if self.config.epoch_enabled {
            let mut epoch = self.epoch.write();
            *epoch += 1;
            self.inner.increment_epoch();
            debug!(epoch = *epoch, "Incremented engine epoch");
        }
    }

    /// Number of times the epoch has been advanced.
    pub fn current_epoch(&self) -> u64 {
        *self.epoch.read()
    }

    /// Check if fuel-based limiting is enabled.
    pub fn fuel_enabled(&self) -> bool {
        self.config.fuel_enabled
    }

    /// Check if epoch-based interruption is enabled.
    pub fn epoch_enabled(&self) -> bool {
        self.config.epoch_enabled
    }
}

impl std::fmt::Debug for TetherEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherEngine")
            .field("config", &self.config)
            .field("epoch", &*self.epoch.read())
            .finish()
    }
}

/// A shared reference to a Tether engine.
pub type SharedEngine = Arc<TetherEngine>;

/// Extension trait for creating shared engines.
pub trait IntoShared {
    /// Convert into a shared engine reference.
    fn into_shared(self) -> SharedEngine;
}

impl IntoShared for TetherEngine {
    fn into_shared(self) -> SharedEngine {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_epoch_increment() {
        let engine = TetherEngine::new(EngineConfig::default()).unwrap();
        assert_eq!(engine.current_epoch(), 0);

        engine.increment_epoch();
        engine.increment_epoch();
        assert_eq!(engine.current_epoch(), 2);
    }

    #[test]
    fn test_engine_without_epochs() {
        let engine = TetherEngine::new(EngineConfig::default().with_epochs(false)).unwrap();

        assert!(!engine.epoch_enabled());
        engine.increment_epoch();
        assert_eq!(engine.current_epoch(), 0);
    }

    #[test]
    fn test_rejects_zero_stack() {
        let config = EngineConfig::default().with_max_wasm_stack(0);
        assert!(matches!(
            TetherEngine::new(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shared_engine() {
        let engine = TetherEngine::default_engine().unwrap().into_shared();
        let other = Arc::clone(&engine);

        engine.increment_epoch();
        assert_eq!(other.current_epoch(), 1);
    }
}

//! Error types for the host side of the guest boundary.

use tether_core::{CodecError, GuestFault};
use thiserror::Error;

/// Errors raised by host imports and backend setup.
///
/// A host import that fails traps the calling guest; the error travels to
/// the outer caller inside the trap.
#[derive(Debug, Error)]
pub enum HostError {
    /// Memory export not found.
    #[error("Memory export 'memory' not found")]
    MemoryNotFound,

    /// The guest passed an argument the import cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The instance's callback table no longer accepts registrations.
    #[error("Callback table of instance {0} is closed")]
    CallbackTableClosed(u32),

    /// The bridge that owned the instance has been dropped.
    #[error("Host bridge is no longer available")]
    BridgeGone,

    /// A value could not cross the boundary.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The guest allocator faulted while the host was writing a value.
    #[error("Guest allocator failed: {0}")]
    Alloc(GuestFault),

    /// Function registration failed.
    #[error("Failed to register function '{module}::{name}': {reason}")]
    RegistrationFailed {
        /// The module name.
        module: String,
        /// The function name.
        name: String,
        /// The reason for failure.
        reason: String,
    },

    /// Function already registered.
    #[error("Function already registered: {module}::{name}")]
    AlreadyRegistered {
        /// The module name.
        module: String,
        /// The function name.
        name: String,
    },
}

impl HostError {
    /// Split allocator faults out of codec errors so they keep their
    /// classification.
    pub(crate) fn from_codec(err: CodecError) -> Self {
        match err {
            CodecError::Alloc(fault) => HostError::Alloc(fault),
            other => HostError::Codec(other),
        }
    }
}

/// Result type for host operations.
pub type HostResult<T> = std::result::Result<T, HostError>;

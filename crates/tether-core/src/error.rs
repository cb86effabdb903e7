//! Core error types for Tether.
//!
//! Errors are grouped by the component that raises them: loading a module,
//! resolving an instance, dispatching a call, converting values across the
//! guest boundary and invoking callbacks. Every error renders as plain text
//! that can be shown to a user as-is, and every error maps to an
//! [`ErrorKind`] so callers can branch without matching on strings.

use thiserror::Error;

use crate::callback::CallbackRef;
use crate::registry::InstanceId;

/// Machine-readable classification of a bridge error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The module bytes could not be compiled.
    InvalidModule,
    /// The module compiled but could not be instantiated.
    InstantiationFailed,
    /// The instance id is unknown or has been unloaded.
    InstanceNotFound,
    /// The instance has no export with the requested name.
    FunctionNotFound,
    /// The guest faulted.
    Trap,
    /// The call would re-enter an instance that is already executing.
    Reentrant,
    /// The call was stopped by an interrupt or the fuel meter.
    Cancelled,
    /// A guest pointer addressed memory outside the guest's linear memory.
    OutOfBounds,
    /// Guest data did not follow the value encoding.
    Malformed,
    /// A value nested deeper than the configured limit.
    DepthExceeded,
    /// A callback reference outlived its instance or slot.
    CallbackInvalid,
    /// The execution engine itself could not be set up.
    Engine,
}

impl ErrorKind {
    /// Stable snake_case name, suitable for logs and JSON output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidModule => "invalid_module",
            ErrorKind::InstantiationFailed => "instantiation_failed",
            ErrorKind::InstanceNotFound => "instance_not_found",
            ErrorKind::FunctionNotFound => "function_not_found",
            ErrorKind::Trap => "trap",
            ErrorKind::Reentrant => "reentrant",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::OutOfBounds => "out_of_bounds",
            ErrorKind::Malformed => "malformed",
            ErrorKind::DepthExceeded => "depth_exceeded",
            ErrorKind::CallbackInvalid => "callback_invalid",
            ErrorKind::Engine => "engine",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for Tether operations.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    /// Error while creating the execution engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Error while loading a module.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Error while resolving an instance.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Error while dispatching a call.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Error while invoking a callback.
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    /// Error while converting a value.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TetherError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TetherError::Engine(_) => ErrorKind::Engine,
            TetherError::Load(e) => e.kind(),
            TetherError::Instance(e) => e.kind(),
            TetherError::Dispatch(e) => e.kind(),
            TetherError::Invoke(e) => e.kind(),
            TetherError::Codec(e) => e.kind(),
        }
    }
}

/// Errors during engine creation and configuration.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Invalid engine configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The underlying engine refused the configuration.
    #[error("Wasmtime error: {0}")]
    Wasmtime(String),
}

impl From<wasmtime::Error> for EngineError {
    fn from(err: wasmtime::Error) -> Self {
        EngineError::Wasmtime(format!("{err:?}"))
    }
}

/// Errors while loading a guest module.
///
/// A failed load never leaves an instance behind.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The bytes are not a valid module.
    #[error("Invalid module: {0}")]
    InvalidModule(String),

    /// The engine could not link or instantiate the module.
    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),
}

impl LoadError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::InvalidModule(_) => ErrorKind::InvalidModule,
            LoadError::InstantiationFailed(_) => ErrorKind::InstantiationFailed,
        }
    }
}

/// Errors while resolving an instance handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    /// No live instance has this id.
    #[error("Instance {0} not found")]
    NotFound(InstanceId),
}

impl InstanceError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstanceError::NotFound(_) => ErrorKind::InstanceNotFound,
        }
    }
}

/// Errors while dispatching a call into a guest.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The target instance could not be resolved.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// The instance has no function export with this exact name.
    #[error("Function not found: '{0}'")]
    FunctionNotFound(String),

    /// The guest faulted, or the engine rejected the call.
    #[error("Guest trap: {0}")]
    Trap(TrapInfo),

    /// The instance is already executing further up the current call stack.
    #[error("Reentrant call into instance {0}")]
    Reentrant(InstanceId),

    /// The call was stopped externally.
    #[error("Call cancelled: {0}")]
    Cancelled(String),

    /// An argument or result could not cross the boundary.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl DispatchError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Instance(e) => e.kind(),
            DispatchError::FunctionNotFound(_) => ErrorKind::FunctionNotFound,
            DispatchError::Trap(_) => ErrorKind::Trap,
            DispatchError::Reentrant(_) => ErrorKind::Reentrant,
            DispatchError::Cancelled(_) => ErrorKind::Cancelled,
            DispatchError::Codec(e) => e.kind(),
        }
    }
}

impl From<GuestFault> for DispatchError {
    fn from(fault: GuestFault) -> Self {
        match fault {
            GuestFault::Trap(info) | GuestFault::Poisoned(info) => DispatchError::Trap(info),
            GuestFault::Interrupted(reason) => DispatchError::Cancelled(reason),
            GuestFault::Host(err) => *err,
        }
    }
}

/// Errors while converting values across the guest boundary.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// A region lies outside the guest's linear memory.
    #[error(
        "Guest memory access out of bounds: offset={offset}, len={len}, memory_size={memory_size}"
    )]
    OutOfBounds {
        /// Start of the requested region.
        offset: u64,
        /// Length of the requested region.
        len: u64,
        /// Size of the guest memory at the time of the access.
        memory_size: u64,
    },

    /// The bytes do not follow the value encoding.
    #[error("Malformed guest value: {0}")]
    Malformed(String),

    /// Nesting went past the configured limit.
    #[error("Value nesting exceeds the depth limit of {limit}")]
    DepthExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// The guest allocator faulted while space was being reserved.
    #[error("Guest allocator failed: {0}")]
    Alloc(GuestFault),
}

impl CodecError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            CodecError::Malformed(_) => ErrorKind::Malformed,
            CodecError::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            CodecError::Alloc(fault) => DispatchError::from(fault.clone()).kind(),
        }
    }
}

/// Errors while invoking a callback reference.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// The owning instance is gone or the slot was released.
    #[error("Callback {0} is no longer valid")]
    CallbackInvalid(CallbackRef),

    /// The callback resolved but the call into the guest failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl InvokeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::CallbackInvalid(_) => ErrorKind::CallbackInvalid,
            InvokeError::Dispatch(e) => e.kind(),
        }
    }
}

/// A fault reported by an engine capability while running guest code.
#[derive(Debug, Clone, Error)]
pub enum GuestFault {
    /// The guest trapped or the engine rejected the call; the instance is
    /// still usable.
    #[error("{0}")]
    Trap(TrapInfo),

    /// Execution was interrupted from outside (epoch or fuel).
    #[error("{0}")]
    Interrupted(String),

    /// The instance state can no longer be trusted.
    #[error("{0}")]
    Poisoned(TrapInfo),

    /// A host import called by the guest failed.
    #[error("{0}")]
    Host(Box<DispatchError>),
}

/// Information about a guest trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapInfo {
    /// The trap code name, if available.
    pub code: Option<String>,
    /// Human-readable trap message.
    pub message: String,
    /// Guest backtrace, kept verbatim.
    pub backtrace: Option<String>,
}

impl TrapInfo {
    /// Create trap information from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            backtrace: None,
        }
    }

    /// Attach a trap code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a backtrace.
    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(backtrace.into());
        self
    }

    /// The fixed trap returned for every call into a poisoned instance.
    pub fn poisoned(id: InstanceId) -> Self {
        Self::new(format!(
            "instance {id} was poisoned by an earlier fault and no longer accepts calls"
        ))
        .with_code("poisoned")
    }
}

impl std::fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] {}", code, self.message)?;
        } else {
            write!(f, "{}", self.message)?;
        }
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{backtrace}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TrapInfo {}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type alias for load operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Result type alias for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Result type alias for callback invocation.
pub type InvokeResult<T> = std::result::Result<T, InvokeError>;

//! Error taxonomy of the harness.
//!
//! Recoverable failures travel as [`HarnessError`]. Broken invariants (a release
//! call failing, a configuration the harness deliberately leaves unsupported)
//! go through `fatal!` instead: they indicate a corrupted driver
//! or a test-author mistake, not a condition to handle.

use std::fmt;

use thiserror::Error;

/// Non-success status reported by the convolution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    NotInitialized,
    AllocFailed,
    BadParam,
    InternalError,
    InvalidValue,
    ExecutionFailed,
    NotSupported,
}

impl EngineStatus {
    /// The engine's error string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "ENGINE_STATUS_NOT_INITIALIZED",
            Self::AllocFailed => "ENGINE_STATUS_ALLOC_FAILED",
            Self::BadParam => "ENGINE_STATUS_BAD_PARAM",
            Self::InternalError => "ENGINE_STATUS_INTERNAL_ERROR",
            Self::InvalidValue => "ENGINE_STATUS_INVALID_VALUE",
            Self::ExecutionFailed => "ENGINE_STATUS_EXECUTION_FAILED",
            Self::NotSupported => "ENGINE_STATUS_NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for EngineStatus {}

/// Result of a single engine call.
pub type EngineResult<T> = Result<T, EngineStatus>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("engine error '{0}'")]
    Engine(#[from] EngineStatus),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("Workspace limit ({limit} bytes) is larger than available memory ({available} bytes)")]
    WorkspaceLimit { limit: usize, available: usize },
    #[error("No supported algorithm")]
    NoSupportedAlgorithm,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid value {value:?} for {name}")]
    Env { name: &'static str, value: String },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Log a diagnostic and abort the current operation by panicking.
///
/// Reserved for invariant violations; everything recoverable returns a
/// [`HarnessError`].
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("{}", message);
        panic!("{}", message)
    }};
}
pub(crate) use fatal;

//! Error types for the host crate.
//!
//! Every condition here indicates a programming error or corrupted input, not
//! a transient failure. Operations still return [`Result`] so callers can
//! observe them; the fatal policy is applied at the boundary with [`fatal`]
//! or [`OrAbort::or_abort`].

use thiserror::Error;

/// Host error type
#[derive(Error, Debug)]
pub enum HostError {
    /// Memory for a trampoline could not be mapped
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// Trampoline requested with more caller arguments than registers allow
    #[error("too many args (got {arity}, expected at most {max})")]
    UnsupportedArity {
        /// Requested arity
        arity: usize,
        /// Largest supported arity
        max: usize,
    },

    /// Trampolines cannot be generated on this host
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),

    /// The OS rejected a page permission transition
    #[error("memory protection failure: {0}")]
    MemoryProtectionFailure(String),

    /// The module engine reported an error message
    #[error("engine {op} failed: {message}")]
    Engine {
        /// Engine operation that failed
        op: &'static str,
        /// Message reported by the engine
        message: String,
    },

    /// An engine call was made while another one on the same session was
    /// still running
    #[error("engine busy, cannot {0}")]
    EngineBusy(&'static str),

    /// The module does not export the requested symbol
    #[error("symbol was not exported from module: {0}")]
    SymbolNotFound(String),

    /// Callback address was never registered with the session
    #[error("callback {0:#x} was not registered")]
    CallbackNotRegistered(usize),

    /// `seal` called on an already sealed session
    #[error("session was already sealed")]
    DoubleSeal,

    /// Setup mutation attempted after the session was sealed
    #[error("cannot {0} after the session was sealed")]
    SetupSealed(&'static str),

    /// `exit` called with the nesting counter already at zero
    #[error("invalid enter count 0 on exit")]
    UnbalancedExit,

    /// No file is mounted under the name
    #[error("no file mounted as {0}")]
    NotMounted(String),

    /// Read-back requested for a read-only mount
    #[error("file {0} was not mounted writable")]
    NotWritable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Config(err.to_string())
    }
}

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, HostError>;

/// Report `err` and abort the process.
pub fn fatal(err: &HostError) -> ! {
    tracing::error!(error = %err, "fatal host error");
    eprintln!("{}", err);
    std::process::abort()
}

/// Apply the fatal policy to a result.
pub trait OrAbort<T> {
    /// Unwrap the value, aborting the process on error.
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(&err),
        }
    }
}

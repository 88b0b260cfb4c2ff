//! Error kinds surfaced by the engine.
//!
//! Every fallible operation in this crate returns [`EngineError`]. The
//! variants mirror the taxonomy in the design doc: configuration/parameter
//! errors are fatal to the invoking command, plugin/runtime errors are
//! task-fatal but do not necessarily abort the whole task graph, and
//! internal errors indicate an invariant was violated.

use crate::action::ActionRef;
use thiserror::Error;

/// The top level error type for `wharf-core`.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Schema or template-resolution failure while building the config graph.
    #[error("configuration error at {path}: {message}")]
    Configuration {
        /// Dotted path to the offending config location (e.g. `deploy.api.spec.ports[0]`).
        path: String,
        /// Human-readable explanation.
        message: String,
    },

    /// Bad CLI input.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// A plugin handler failed internally (not the same as the operation it
    /// performs reporting failure -- see [`crate::task::TaskStatus`]).
    #[error("plugin error in handler {handler} for {action}: {message}")]
    Plugin {
        /// The handler name, e.g. `build` or `getStatus`.
        handler: String,
        /// The action the handler was invoked for.
        action: ActionRef,
        /// Human-readable explanation.
        message: String,
    },

    /// A plugin reported that the operation it performs (build, deploy, ...)
    /// itself failed, as opposed to the handler invocation failing.
    #[error("runtime error for {action}: {message}")]
    Runtime {
        /// The action the operation was performed against.
        action: ActionRef,
        /// Human-readable explanation.
        message: String,
    },

    /// A task exceeded its declared timeout.
    #[error("task {0} timed out")]
    Timeout(String),

    /// The command's cancellation token was triggered.
    #[error("cancelled")]
    Cancellation,

    /// A referenced key, action, or handler does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `test --skip-dependencies` found a `Deploy` dependency whose status
    /// is not `ready` (spec.md §8 scenario 2); the test cannot proceed
    /// against infrastructure it was told not to redeploy.
    #[error("{action} depends on {dependency}, which is not ready (status: {status:?})")]
    DependencyNotReady {
        /// The action whose task was blocked.
        action: ActionRef,
        /// The dependency whose status gated it.
        dependency: ActionRef,
        /// The observed status.
        status: crate::task::TaskStatus,
    },

    /// An invariant inside the engine was violated; this is always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Maps the error to the process exit code described in the CLI surface
    /// spec: `0` success, `1` runtime failure, `2` configuration error,
    /// `130` cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Configuration { .. } | EngineError::Parameter(_) => 2,
            EngineError::Cancellation => 130,
            _ => 1,
        }
    }

    /// True if this error kind should abort the whole task-graph pass rather
    /// than just the task that produced it (spec.md §7).
    pub fn is_pass_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration { .. } | EngineError::Internal(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

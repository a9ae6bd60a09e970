//! Error types for sequence loading, validation, and execution.
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//! Failures raised *by user functions* are not errors in this sense: they are
//! data, captured into [`NodeResult`](crate::node_result::NodeResult) records
//! so the sequence can branch on them. `EngineError` covers the cases where
//! the engine itself cannot continue.

use crate::expr::EvalError;
use crate::graph::NodeId;
use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Comprehensive error type for engine operations.
///
/// # Error Categories
///
/// - **Loading**: `Load`, `Yaml` — the sequence file could not be read or
///   did not match the expected shape.
/// - **Validation**: `Validation`, `UnknownFunction`, `UnknownWrapper` — the
///   graph or its registries are inconsistent; no run is performed.
/// - **Execution**: `Eval`, `NoTransitionFired`, `ProtectedWrite` — fatal
///   conditions with no branch-level recourse; the run ends with an error
///   outcome.
/// - **Cancellation**: `Cancelled`.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The sequence file could not be interpreted as a sequence definition.
    #[error("sequence load failed: {0}")]
    Load(String),

    /// Graph structure validation failed.
    ///
    /// Raised when a structural invariant does not hold: no start node, an
    /// unresolved transition target, a duplicate node id, a start node with
    /// incoming transitions, or a non-stop node without outgoing transitions.
    #[error("sequence validation failed: {0}")]
    Validation(String),

    /// An expression failed to evaluate in a context that has no owning
    /// function node (a transition condition or a variable-node assignment).
    #[error("expression error in {context}: {source}")]
    Eval {
        /// Where the expression appeared, e.g. `transition 3 -> 5`.
        context: String,
        #[source]
        source: EvalError,
    },

    /// A non-split node completed and none of its outgoing conditions held.
    #[error("node {node} completed but no outgoing transition fired")]
    NoTransitionFired { node: NodeId },

    /// A variable node (or a `returns` alias) targeted a builtin or constant
    /// name.
    #[error("variable '{name}' is protected and cannot be assigned")]
    ProtectedWrite { name: String },

    /// A function node references a function missing from the registry.
    #[error("function '{0}' is not registered")]
    UnknownFunction(String),

    /// A function node references a wrapper missing from the registry.
    #[error("wrapper '{0}' is not registered")]
    UnknownWrapper(String),

    /// The run was cancelled before it could terminate on its own.
    #[error("run cancelled")]
    Cancelled,

    /// YAML parsing error while reading a sequence file.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Create an evaluation error with its owning context.
    pub fn eval(context: impl Into<String>, source: EvalError) -> Self {
        Self::Eval {
            context: context.into(),
            source,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

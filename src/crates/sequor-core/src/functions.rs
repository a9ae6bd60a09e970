//! User functions and wrappers: the callables the engine invokes at
//! function nodes, and the registries that map names to them.
//!
//! A callable receives an [`Invocation`]: its evaluated arguments (owned
//! deep copies, so mutating them never touches sequence variables) plus a
//! cancellation token it may honor or ignore. Failure is signalled with a
//! structured [`FnError`], which the engine captures into the node's result
//! record instead of treating as control flow.

use crate::node_result::ErrInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Structured failure raised by a user function or wrapper.
///
/// The name and arguments survive verbatim into `results[<id>].exception`,
/// so sequence conditions can dispatch on them.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{name}")]
pub struct FnError {
    pub name: String,

    #[serde(default)]
    pub args: Map<String, Value>,
}

impl FnError {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
        }
    }

    /// Attach a named argument, builder style.
    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Shorthand for the common name-plus-message shape.
    pub fn with_message(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name).with_arg("message", Value::from(message.into()))
    }
}

impl From<FnError> for ErrInfo {
    fn from(err: FnError) -> Self {
        ErrInfo {
            name: err.name,
            args: err.args,
        }
    }
}

/// Everything a user function receives for one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Evaluated argument bindings, keyed by the names declared on the node.
    pub args: Map<String, Value>,

    /// Cancelled on run-level cancel and on per-node timeout. Long-running
    /// functions should select against it; short ones can ignore it.
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Fetch a required argument, failing the invocation if it is missing.
    pub fn required(&self, name: &str) -> Result<&Value, FnError> {
        self.args.get(name).ok_or_else(|| {
            FnError::with_message("MissingArgument", format!("argument '{name}' not provided"))
        })
    }
}

/// Future type returned by user functions.
pub type FnFuture = Pin<Box<dyn Future<Output = Result<Value, FnError>> + Send>>;

/// A registered user function.
pub type SequenceFn = Arc<dyn Fn(Invocation) -> FnFuture + Send + Sync>;

/// Registry mapping function names to callables.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, SequenceFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under a name, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Invocation) -> FnFuture + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn get(&self, name: &str) -> Option<SequenceFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted, for error messages.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// The wrapper capability contract.
///
/// Anything implementing `pre`/`post` qualifies; no base type is required.
/// A wrapper is constructed fresh for each function-node invocation with its
/// evaluated arguments. `pre` runs before the user function in declared
/// order and its return value becomes `wrappers.<name>` inside the node's
/// argument bindings; `post` runs after in reverse order, including when the
/// function failed or timed out.
#[async_trait]
pub trait Wrapper: Send {
    async fn pre(&mut self) -> Result<Value, FnError>;

    async fn post(&mut self) -> Result<(), FnError>;
}

/// Constructor for a wrapper: evaluated arguments plus the invocation's
/// cancellation token.
pub type WrapperFactory =
    Arc<dyn Fn(Map<String, Value>, CancellationToken) -> Box<dyn Wrapper> + Send + Sync>;

/// Registry mapping wrapper names to factories.
#[derive(Clone, Default)]
pub struct WrapperRegistry {
    factories: HashMap<String, WrapperFactory>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Map<String, Value>, CancellationToken) -> Box<dyn Wrapper> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<WrapperFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl std::fmt::Debug for WrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("WrapperRegistry")
            .field("wrappers", &names)
            .finish()
    }
}

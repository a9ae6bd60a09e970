//! Shared sequence variables and the environment snapshots expressions
//! evaluate against.
//!
//! Three disjoint namespaces share one read lookup, with precedence
//! `builtin > constant > on-the-fly`:
//!
//! - **built-ins** — `results` (node id → last result record), `logger`
//!   (the run's log-target handle), `wrappers` (layered in per function-node
//!   invocation, never stored here). Only the engine writes these.
//! - **constants** — fixed at run start, read-only afterwards.
//! - **on-the-fly** — created and overwritten by variable nodes.
//!
//! All mutation happens on the scheduler's coordinator; everything handed to
//! workers or to the evaluator is an owned [`Env`] snapshot.

use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::node_result::NodeResult;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Names the engine reserves; neither constants nor variable nodes may bind
/// them.
pub const PROTECTED_NAMES: [&str; 3] = ["results", "logger", "wrappers"];

/// An immutable snapshot of the variable store, used for one expression
/// evaluation (or one function-node invocation).
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn insert(&mut self, name: String, value: Value) {
        self.vars.insert(name, value);
    }

    /// Layer one extra binding on top of this snapshot, consuming it.
    ///
    /// Used by the function-node executor to publish the wrapper-local map
    /// for the duration of one invocation.
    pub fn with_binding(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }
}

/// The engine's variable store. Owned and mutated by the coordinator only.
#[derive(Debug)]
pub struct VariableStore {
    constants: HashMap<String, Value>,
    on_the_fly: HashMap<String, Value>,
    results: HashMap<NodeId, NodeResult>,
    log_target: String,
}

impl VariableStore {
    /// Create a store with the run's constants.
    ///
    /// Rejects constants that shadow a protected name.
    pub fn new(constants: HashMap<String, Value>, log_target: impl Into<String>) -> Result<Self> {
        for name in constants.keys() {
            if Self::is_protected(name) {
                return Err(EngineError::ProtectedWrite { name: name.clone() });
            }
        }
        Ok(Self {
            constants,
            on_the_fly: HashMap::new(),
            results: HashMap::new(),
            log_target: log_target.into(),
        })
    }

    pub fn is_protected(name: &str) -> bool {
        PROTECTED_NAMES.contains(&name)
    }

    /// Write an on-the-fly variable.
    ///
    /// Writes to protected or constant names are an error; there is no
    /// branch-level recourse for them, so the caller treats the failure as
    /// fatal.
    pub fn set_on_the_fly(&mut self, name: &str, value: Value) -> Result<()> {
        if Self::is_protected(name) || self.constants.contains_key(name) {
            return Err(EngineError::ProtectedWrite {
                name: name.to_string(),
            });
        }
        self.on_the_fly.insert(name.to_string(), value);
        Ok(())
    }

    /// Commit a node result, replacing the previous run's slot.
    pub fn set_result(&mut self, result: NodeResult) {
        self.results.insert(result.nid, result);
    }

    pub fn result(&self, id: NodeId) -> Option<&NodeResult> {
        self.results.get(&id)
    }

    pub fn results(&self) -> &HashMap<NodeId, NodeResult> {
        &self.results
    }

    pub fn on_the_fly(&self) -> &HashMap<String, Value> {
        &self.on_the_fly
    }

    /// Build an environment snapshot.
    ///
    /// Insertion order implements the read precedence: on-the-fly first,
    /// then constants, then built-ins, later writes shadowing earlier ones.
    pub fn snapshot(&self) -> Env {
        let mut env = Env::default();
        for (name, value) in &self.on_the_fly {
            env.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.constants {
            env.insert(name.clone(), value.clone());
        }

        let mut results = Map::with_capacity(self.results.len());
        for (id, result) in &self.results {
            results.insert(id.to_string(), json!(result));
        }
        env.insert("results".to_string(), Value::Object(results));
        env.insert("logger".to_string(), Value::from(self.log_target.clone()));
        env
    }
}

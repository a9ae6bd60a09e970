//! # sequor-core - Concurrent Sequence Engine
//!
//! A runtime that executes a user-authored control-flow graph whose action
//! nodes invoke externally-provided async functions. Sequences are declared
//! in YAML; the engine loads and validates the graph, then drives *tokens*
//! through it across concurrent branches with conditional transitions,
//! parallel fork/join, shared named variables, per-node wrappers, and
//! per-node timeouts.
//!
//! ## Core Concepts
//!
//! - **Nodes**: `start`, `stop`, `function` (invokes a registered callable),
//!   `variable` (assigns shared variables), `parallel_split` (fans a token
//!   out), `parallel_sync` (joins branches back together).
//! - **Transitions**: outgoing edges with optional condition expressions,
//!   evaluated in declared order. Every node except a split fires exactly
//!   one; a split fires all that hold.
//! - **Tokens and colors**: a token is a live execution point. Each split
//!   firing stamps a fresh *color* on the tokens it emits; the matching
//!   sync collects arrivals per color, so looped re-entry and nested splits
//!   never cross wires.
//! - **Results as data**: a function failure is captured into
//!   `results[<id>]` rather than aborting the run; the sequence decides
//!   what happens next through its conditions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sequor_core::{FnFuture, FunctionRegistry, Runner, RunOptions, SequenceDef, WrapperRegistry};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), sequor_core::EngineError> {
//! let yaml = r#"
//! name: greet
//! constants:
//!   who: John
//! nodes:
//!   - id: 0
//!     type: start
//!     transitions: [{ target: 1 }]
//!   - id: 1
//!     type: function
//!     function: hello
//!     arguments: { name: who }
//!     transitions: [{ target: 2 }]
//!   - id: 2
//!     type: stop
//! "#;
//!
//! let mut functions = FunctionRegistry::new();
//! functions.register("hello", |inv| {
//!     Box::pin(async move {
//!         let name = inv.required("name")?.clone();
//!         Ok(json!(format!("Hello, {}!", name.as_str().unwrap_or("?"))))
//!     }) as FnFuture
//! });
//!
//! let def = SequenceDef::from_str(yaml)?;
//! let runner = Runner::from_sequence(def, functions, WrapperRegistry::new(), RunOptions::default())?;
//! let outcome = runner.run().await;
//! println!("status: {:?}", outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  SequenceDef (YAML) ──► Graph (validated, immutable)
//!                            │
//!                            ▼
//!  Runner ───────────► Scheduler (single coordinator)
//!    │                    │  ready queue · sync arrivals · color counter
//!    │                    │  variable store · result registry
//!    │                    ▼
//!    │                 worker pool ── execute_function
//!    │                    │             wrappers pre → fn (timeout) → post
//!    └── RunHandle        └── completion channel back to the coordinator
//! ```
//!
//! The coordinator is the only writer of shared state; workers receive
//! owned environment snapshots and argument values (deep copies), so user
//! functions can never mutate sequence variables by reference.
//!
//! ## Module Organization
//!
//! - [`reader`] - YAML sequence definitions and the round-trippable format
//! - [`graph`] - node/transition model and structural validation
//! - [`expr`] - the restricted expression language
//! - [`vars`] - variable store and environment snapshots
//! - [`functions`] - function/wrapper registries and the callable contract
//! - [`node_result`] - per-node result records
//! - [`scheduler`] - tokens, colors, and the coordinator loop
//! - [`runner`] - public run API, outcomes, cancellation

pub mod error;
mod executor;
pub mod expr;
pub mod functions;
pub mod graph;
pub mod node_result;
pub mod reader;
pub mod runner;
pub mod scheduler;
pub mod vars;

// Re-export main types
pub use error::{EngineError, Result};
pub use expr::{evaluate, evaluate_condition, EvalError};
pub use functions::{
    FnError, FnFuture, FunctionRegistry, Invocation, SequenceFn, Wrapper, WrapperFactory,
    WrapperRegistry,
};
pub use graph::{
    FunctionNode, Graph, Node, NodeId, NodeKind, Transition, VariableNode, WrapperSpec,
};
pub use node_result::{ErrInfo, ExceptionInfo, NodeResult};
pub use reader::{NodeDef, NodeKindDef, SequenceDef, TransitionDef, WrapperDef};
pub use runner::{RunHandle, RunOptions, RunOutcome, RunState, RunStatus, Runner};
pub use scheduler::{Color, RunStats};
pub use vars::{Env, VariableStore, PROTECTED_NAMES};

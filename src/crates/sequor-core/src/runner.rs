//! The public entry point: build a [`Runner`] from a validated graph plus
//! registries, then [`run`](Runner::run) it to completion or drive it in the
//! background through a [`RunHandle`].
//!
//! A runner owns no ambient state; several runners can coexist in one
//! process, each with its own registries, constants, and options.

use crate::error::{EngineError, Result};
use crate::functions::{FunctionRegistry, WrapperRegistry};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::node_result::{ErrInfo, NodeResult};
use crate::reader::SequenceDef;
use crate::scheduler::{RunStats, Scheduler};
use crate::vars::VariableStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Run-level tuning knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum function nodes executing concurrently.
    pub workers: usize,

    /// Timeout applied to function nodes that declare none.
    pub default_timeout: Option<Duration>,

    /// How long cancellation waits for in-flight functions before aborting
    /// their tasks.
    pub drain_deadline: Duration,

    /// Name bound to the `logger` builtin and attached to the run's log
    /// span.
    pub log_target: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            default_timeout: None,
            drain_deadline: Duration::from_secs(5),
            log_target: "sequor".to_string(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The sequence terminated and no test node failed.
    Completed,

    /// The sequence terminated, but at least one `is_test` node recorded a
    /// function failure.
    TestFailed,

    /// A fatal engine error ended the run early.
    Error,
}

/// Everything a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,

    /// Results of the `is_test` nodes whose function failed.
    pub failed_tests: Vec<NodeResult>,

    /// The fatal error for [`RunStatus::Error`] outcomes.
    pub fatal: Option<ErrInfo>,

    /// Whether an external cancel cut the run short. The status reflects
    /// the work that did complete.
    pub cancelled: bool,

    /// Final result registry, node id → last result.
    pub results: HashMap<NodeId, NodeResult>,

    /// Final on-the-fly variables.
    pub variables: HashMap<String, Value>,

    pub stats: RunStats,
}

impl RunOutcome {
    /// Exit code for a CLI wrapper: 0 completed, 1 test failure, 2 fatal.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::TestFailed => 1,
            RunStatus::Error => 2,
        }
    }

    pub fn result(&self, id: NodeId) -> Option<&NodeResult> {
        self.results.get(&id)
    }

    fn from_fatal(err: &EngineError) -> Self {
        Self {
            status: RunStatus::Error,
            failed_tests: Vec::new(),
            fatal: Some(fatal_info(err)),
            cancelled: false,
            results: HashMap::new(),
            variables: HashMap::new(),
            stats: RunStats::default(),
        }
    }
}

/// Collapse an engine error into the `ErrInfo` shape surfaced in outcomes.
pub(crate) fn fatal_info(err: &EngineError) -> ErrInfo {
    let name = match err {
        EngineError::Load(_) => "LoadError",
        EngineError::Validation(_) => "ValidationError",
        EngineError::Eval { .. } => "EvalError",
        EngineError::NoTransitionFired { .. } => "NoTransitionFired",
        EngineError::ProtectedWrite { .. } => "ProtectedWrite",
        EngineError::UnknownFunction(_) => "UnknownFunction",
        EngineError::UnknownWrapper(_) => "UnknownWrapper",
        EngineError::Cancelled => "Cancelled",
        EngineError::Yaml(_) => "YamlError",
    };
    ErrInfo::new(name).with_arg("message", Value::from(err.to_string()))
}

/// State reported by [`RunHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Finished,
}

/// Handle to a run started with [`Runner::run_async`].
pub struct RunHandle {
    join: JoinHandle<RunOutcome>,
    cancel: CancellationToken,
    status: watch::Receiver<RunState>,
}

impl RunHandle {
    /// Signal the run to stop: no new function dispatches, best-effort
    /// interrupt of in-flight ones, then drain.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> RunState {
        *self.status.borrow()
    }

    /// Wait for the run to terminate and take its outcome.
    pub async fn wait(self) -> RunOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "run task aborted");
                RunOutcome::from_fatal(&EngineError::Cancelled)
            }
        }
    }
}

/// An executable sequence: graph + registries + constants + options.
#[derive(Clone, Debug)]
pub struct Runner {
    graph: Arc<Graph>,
    functions: Arc<FunctionRegistry>,
    wrappers: Arc<WrapperRegistry>,
    constants: HashMap<String, Value>,
    options: RunOptions,
}

impl Runner {
    /// Build a runner, cross-checking the graph against the registries and
    /// constants so a run cannot fail on a lookup the author could have
    /// caught up front.
    pub fn new(
        graph: Graph,
        functions: FunctionRegistry,
        wrappers: WrapperRegistry,
        constants: HashMap<String, Value>,
        options: RunOptions,
    ) -> Result<Self> {
        for name in constants.keys() {
            if VariableStore::is_protected(name) {
                return Err(EngineError::ProtectedWrite { name: name.clone() });
            }
        }
        for node in graph.nodes() {
            match &node.kind {
                NodeKind::Function(spec) => {
                    if !functions.contains(&spec.function) {
                        return Err(EngineError::UnknownFunction(spec.function.clone()));
                    }
                    for wrapper in &spec.wrappers {
                        if !wrappers.contains(&wrapper.name) {
                            return Err(EngineError::UnknownWrapper(wrapper.name.clone()));
                        }
                    }
                    if let Some(alias) = &spec.returns {
                        if VariableStore::is_protected(alias) || constants.contains_key(alias) {
                            return Err(EngineError::ProtectedWrite {
                                name: alias.clone(),
                            });
                        }
                    }
                }
                NodeKind::Variable(spec) => {
                    for (name, _) in &spec.assignments {
                        if VariableStore::is_protected(name) || constants.contains_key(name) {
                            return Err(EngineError::ProtectedWrite { name: name.clone() });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(Self {
            graph: Arc::new(graph),
            functions: Arc::new(functions),
            wrappers: Arc::new(wrappers),
            constants,
            options,
        })
    }

    /// Build a runner straight from a parsed sequence definition, taking
    /// the constants declared in the file.
    pub fn from_sequence(
        def: SequenceDef,
        functions: FunctionRegistry,
        wrappers: WrapperRegistry,
        options: RunOptions,
    ) -> Result<Self> {
        let options = options.with_log_target(def.name.clone());
        let (graph, constants) = def.into_graph()?;
        Self::new(graph, functions, wrappers, constants, options)
    }

    /// Execute the sequence and block (asynchronously) until it terminates.
    pub async fn run(&self) -> RunOutcome {
        self.run_with_cancel(CancellationToken::new()).await
    }

    /// Start the sequence in the background.
    pub fn run_async(&self) -> RunHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunState::Running);
        let runner = self.clone();
        let run_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let outcome = runner.run_with_cancel(run_cancel).await;
            let _ = status_tx.send(RunState::Finished);
            outcome
        });
        RunHandle {
            join,
            cancel,
            status: status_rx,
        }
    }

    async fn run_with_cancel(&self, cancel: CancellationToken) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "sequence_run",
            run_id = %run_id,
            target = %self.options.log_target
        );
        async move {
            tracing::info!(nodes = self.graph.node_count(), "starting run");
            let scheduler = Scheduler::new(
                Arc::clone(&self.graph),
                Arc::clone(&self.functions),
                Arc::clone(&self.wrappers),
                self.constants.clone(),
                self.options.clone(),
                cancel,
            );
            match scheduler {
                Ok(scheduler) => scheduler.run().await,
                Err(err) => {
                    tracing::error!(error = %err, "run could not start");
                    RunOutcome::from_fatal(&err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

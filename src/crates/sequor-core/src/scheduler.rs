//! The token scheduler: a single coordinator that owns every piece of
//! mutable run state, plus a bounded pool of worker tasks for function
//! nodes.
//!
//! The coordinator is the sole writer of the variable store, the result
//! registry, the sync arrival map, the ready queue, and the color counter.
//! Workers only ever see owned snapshots and report back over a completion
//! channel, so no state needs locking.
//!
//! # Colors
//!
//! Every token carries a [`Color`]: a stack of split-firing ids rooted at
//! `0`. Each firing of a parallel split mints a fresh id and pushes it onto
//! the stack of every token it emits; the matching sync aggregates arrivals
//! per color and pops the stack when it fires. Keying arrivals by the full
//! stack keeps waves apart when a loop re-enters a split before an earlier
//! wave has reached the sync, and keeps nested splits apart without any
//! extra bookkeeping.

use crate::error::{EngineError, Result};
use crate::executor::{self, FunctionCall};
use crate::expr;
use crate::functions::{FunctionRegistry, WrapperRegistry};
use crate::graph::{FunctionNode, Graph, NodeId, NodeKind};
use crate::node_result::NodeResult;
use crate::runner::{RunOptions, RunOutcome, RunStatus};
use crate::vars::VariableStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A tag identifying one firing of a parallel split, carried by every token.
///
/// Represented as an immutable stack of firing ids; the root color is the
/// single-element stack `0`. Cloning is cheap (shared slice).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Color(Arc<[u64]>);

impl Color {
    /// The color all start tokens share.
    pub fn root() -> Self {
        Self(Arc::from(vec![0]))
    }

    /// Push a fresh split-firing id.
    pub(crate) fn child(&self, firing: u64) -> Self {
        let mut stack = self.0.to_vec();
        stack.push(firing);
        Self(Arc::from(stack))
    }

    /// Pop the innermost split-firing id. `None` at the root.
    pub(crate) fn parent(&self) -> Option<Self> {
        match self.0.len() {
            0 | 1 => None,
            n => Some(Self(Arc::from(self.0[..n - 1].to_vec()))),
        }
    }

    /// Nesting depth, 1 at the root.
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color({self})")
    }
}

/// A live execution point moving through the graph.
#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub id: Uuid,
    pub node: NodeId,
    pub color: Color,
    /// Source node of the transition that emitted this token; `None` only
    /// for the seed tokens placed on start nodes.
    pub from: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    fn new(node: NodeId, color: Color, from: Option<NodeId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node,
            color,
            from,
            created_at: Utc::now(),
        }
    }
}

/// Counters surfaced in the run outcome.
///
/// Outside of cancellation, `tokens_created == tokens_consumed` at
/// termination: every token is eventually executed or absorbed by a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub tokens_created: u64,
    pub tokens_consumed: u64,
    pub sync_firings: u64,
    pub functions_invoked: u64,
}

/// Worker → coordinator completion event.
struct Completion {
    token_id: Uuid,
    node: NodeId,
    color: Color,
    result: NodeResult,
}

struct InFlight {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub(crate) struct Scheduler {
    graph: Arc<Graph>,
    functions: Arc<FunctionRegistry>,
    wrappers: Arc<WrapperRegistry>,
    store: VariableStore,
    options: RunOptions,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,

    ready: VecDeque<Token>,
    in_flight: HashMap<Uuid, InFlight>,
    /// Per (sync node, color): source ids that have delivered a token.
    arrivals: HashMap<(NodeId, Color), BTreeSet<NodeId>>,
    next_firing: u64,
    failed_tests: Vec<NodeResult>,
    stats: RunStats,
    /// Set while winding down (fatal error or cancel): completions still
    /// commit their results, but no transition fires and nothing new is
    /// dispatched.
    draining: bool,

    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl Scheduler {
    pub(crate) fn new(
        graph: Arc<Graph>,
        functions: Arc<FunctionRegistry>,
        wrappers: Arc<WrapperRegistry>,
        constants: HashMap<String, Value>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let store = VariableStore::new(constants, options.log_target.clone())?;
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
        Ok(Self {
            graph,
            functions,
            wrappers,
            store,
            options,
            cancel,
            semaphore,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            arrivals: HashMap::new(),
            next_firing: 1,
            failed_tests: Vec::new(),
            stats: RunStats::default(),
            draining: false,
            completion_tx,
            completion_rx,
        })
    }

    /// Drive the run to termination: no ready tokens and no in-flight
    /// executions left.
    pub(crate) async fn run(mut self) -> RunOutcome {
        let start_nodes: Vec<_> = self.graph.start_nodes().to_vec();
        for start in start_nodes {
            self.enqueue(Token::new(start, Color::root(), None));
        }

        let mut fatal: Option<EngineError> = None;
        loop {
            while !self.cancel.is_cancelled() {
                let Some(token) = self.ready.pop_front() else {
                    break;
                };
                if let Err(err) = self.step(token) {
                    fatal = Some(err);
                    break;
                }
            }
            if fatal.is_some() || self.cancel.is_cancelled() {
                break;
            }
            if self.in_flight.is_empty() {
                break;
            }
            let cancel = self.cancel.clone();
            tokio::select! {
                maybe = self.completion_rx.recv() => match maybe {
                    Some(completion) => {
                        if let Err(err) = self.on_completion(completion) {
                            fatal = Some(err);
                            break;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {}
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if let Some(err) = &fatal {
            tracing::error!(error = %err, "run failed");
        }
        self.drain().await;

        let status = if fatal.is_some() {
            RunStatus::Error
        } else if !self.failed_tests.is_empty() {
            RunStatus::TestFailed
        } else {
            RunStatus::Completed
        };
        tracing::info!(
            ?status,
            cancelled,
            tokens = self.stats.tokens_created,
            sync_firings = self.stats.sync_firings,
            "run terminated"
        );
        RunOutcome {
            status,
            failed_tests: self.failed_tests,
            fatal: fatal.as_ref().map(crate::runner::fatal_info),
            cancelled,
            results: self.store.results().clone(),
            variables: self.store.on_the_fly().clone(),
            stats: self.stats,
        }
    }

    /// Wind down after termination, cancel, or a fatal error. Straggler
    /// completions are committed until the drain deadline, after which the
    /// remaining workers are aborted.
    async fn drain(&mut self) {
        self.draining = true;
        self.stats.tokens_consumed += self.ready.len() as u64;
        self.ready.clear();
        if self.in_flight.is_empty() {
            return;
        }
        tracing::info!(in_flight = self.in_flight.len(), "draining in-flight functions");
        for in_flight in self.in_flight.values() {
            in_flight.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + self.options.drain_deadline;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.completion_rx.recv()).await {
                Ok(Some(completion)) => {
                    if let Err(err) = self.on_completion(completion) {
                        tracing::warn!(error = %err, "error while draining");
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        aborted = self.in_flight.len(),
                        "drain deadline passed, aborting workers"
                    );
                    for (_, in_flight) in self.in_flight.drain() {
                        in_flight.handle.abort();
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, token: Token) {
        self.stats.tokens_created += 1;
        tracing::trace!(node = token.node, color = %token.color, "token created");
        self.ready.push_back(token);
    }

    /// Consume one ready token and act on its node.
    fn step(&mut self, token: Token) -> Result<()> {
        self.stats.tokens_consumed += 1;
        tracing::trace!(
            node = token.node,
            color = %token.color,
            queued_ms = (Utc::now() - token.created_at).num_milliseconds(),
            "token consumed"
        );
        let graph = Arc::clone(&self.graph);
        let node = graph.node(token.node).ok_or_else(|| {
            EngineError::validation(format!("token at unknown node {}", token.node))
        })?;
        match &node.kind {
            NodeKind::Start => self.fire_one(node.id, &token.color),
            NodeKind::Stop => {
                tracing::debug!(node = node.id, color = %token.color, "stop reached");
                Ok(())
            }
            NodeKind::Variable(spec) => {
                executor::apply_variable_node(node.id, spec, &mut self.store)?;
                self.fire_one(node.id, &token.color)
            }
            NodeKind::ParallelSplit => self.fire_split(node.id, &token.color),
            NodeKind::ParallelSync => self.on_sync_arrival(node.id, token),
            NodeKind::Function(spec) => self.dispatch_function(node.id, spec.clone(), token),
        }
    }

    /// Evaluate a transition's condition against a fresh snapshot.
    fn condition_holds(
        &self,
        condition: &Option<String>,
        env: &crate::vars::Env,
        source: NodeId,
        target: NodeId,
    ) -> Result<bool> {
        match condition {
            None => Ok(true),
            Some(expression) => {
                expr::evaluate_condition(expression, env).map_err(|e| {
                    EngineError::eval(format!("condition on transition {source} -> {target}"), e)
                })
            }
        }
    }

    /// Fire exactly one outgoing transition: the first whose condition
    /// holds, in declared order. Zero true transitions is fatal.
    fn fire_one(&mut self, source: NodeId, color: &Color) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let env = self.store.snapshot();
        for transition in graph.outgoing(source) {
            if self.condition_holds(&transition.condition, &env, source, transition.target)? {
                self.enqueue(Token::new(transition.target, color.clone(), Some(source)));
                return Ok(());
            }
        }
        Err(EngineError::NoTransitionFired { node: source })
    }

    /// Fire every true transition of a parallel split under one freshly
    /// minted color.
    fn fire_split(&mut self, source: NodeId, color: &Color) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let env = self.store.snapshot();
        let mut targets = Vec::new();
        for transition in graph.outgoing(source) {
            if self.condition_holds(&transition.condition, &env, source, transition.target)? {
                targets.push(transition.target);
            }
        }
        if targets.is_empty() {
            tracing::warn!(node = source, "parallel split fired no transitions; wave ends here");
            return Ok(());
        }
        let firing = self.next_firing;
        self.next_firing += 1;
        let child = color.child(firing);
        tracing::debug!(node = source, color = %child, branches = targets.len(), "parallel split fired");
        for target in targets {
            self.enqueue(Token::new(target, child.clone(), Some(source)));
        }
        Ok(())
    }

    /// Record a sync arrival; fire when the color's arrival set equals the
    /// static expected set, restoring the pre-split color on the way out.
    fn on_sync_arrival(&mut self, sync: NodeId, token: Token) -> Result<()> {
        let source = token.from.ok_or_else(|| {
            EngineError::validation(format!("sync node {sync} received a seed token"))
        })?;
        let expected = self
            .graph
            .expected_arrivals(sync)
            .cloned()
            .unwrap_or_default();

        let key = (sync, token.color.clone());
        let arrived = self.arrivals.entry(key.clone()).or_default();
        arrived.insert(source);
        tracing::trace!(
            node = sync,
            color = %token.color,
            arrived = arrived.len(),
            expected = expected.len(),
            "sync arrival"
        );
        if *arrived != expected {
            return Ok(());
        }

        self.arrivals.remove(&key);
        self.stats.sync_firings += 1;
        let exit_color = token.color.parent().unwrap_or_else(|| token.color.clone());
        tracing::debug!(node = sync, color = %token.color, "parallel sync fired");
        self.fire_one(sync, &exit_color)
    }

    /// Hand a function node to the worker pool.
    fn dispatch_function(&mut self, node_id: NodeId, spec: FunctionNode, token: Token) -> Result<()> {
        let function = self
            .functions
            .get(&spec.function)
            .ok_or_else(|| EngineError::UnknownFunction(spec.function.clone()))?;
        let mut wrappers = Vec::with_capacity(spec.wrappers.len());
        for wrapper in &spec.wrappers {
            let factory = self
                .wrappers
                .get(&wrapper.name)
                .ok_or_else(|| EngineError::UnknownWrapper(wrapper.name.clone()))?;
            wrappers.push((wrapper.clone(), factory));
        }

        let cancel = self.cancel.child_token();
        let call = FunctionCall {
            node_id,
            env: self.store.snapshot(),
            timeout: spec.timeout.or(self.options.default_timeout),
            spec,
            function,
            wrappers,
            cancel: cancel.clone(),
        };

        let tx = self.completion_tx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let token_id = token.id;
        let color = token.color.clone();
        self.stats.functions_invoked += 1;
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = executor::execute_function(call).await;
            let _ = tx.send(Completion {
                token_id,
                node: node_id,
                color,
                result,
            });
        });
        self.in_flight.insert(token.id, InFlight { handle, cancel });
        Ok(())
    }

    /// Commit a worker's result and fire the node's transition.
    fn on_completion(&mut self, completion: Completion) -> Result<()> {
        if self.in_flight.remove(&completion.token_id).is_none() {
            // Aborted during a hard-kill; its result no longer matters.
            return Ok(());
        }
        let graph = Arc::clone(&self.graph);
        let node = graph.node(completion.node).ok_or_else(|| {
            EngineError::validation(format!("completion for unknown node {}", completion.node))
        })?;
        tracing::debug!(
            node = completion.node,
            color = %completion.color,
            failed = completion.result.failed(),
            "function node completed"
        );

        if let NodeKind::Function(spec) = &node.kind {
            if spec.is_test && completion.result.function_failed() {
                tracing::warn!(node = completion.node, "test node failed");
                self.failed_tests.push(completion.result.clone());
            }
            let returned = completion.result.returned.clone();
            self.store.set_result(completion.result);
            if let (Some(alias), Some(value)) = (&spec.returns, returned) {
                self.store.set_on_the_fly(alias, value)?;
            }
        }

        if self.draining || self.cancel.is_cancelled() {
            return Ok(());
        }
        self.fire_one(completion.node, &completion.color)
    }
}

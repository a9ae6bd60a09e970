//! The in-memory sequence graph: typed nodes, outgoing transitions keyed by
//! source node, and the structural invariants enforced at load time.
//!
//! A graph is built once (normally by the [`reader`](crate::reader)) and is
//! read-only for the rest of its life. Sequences are intentionally cyclic;
//! the structure is a flat registry of nodes plus edges keyed by source id,
//! so loops need no special handling and node lifetime equals graph lifetime.

use crate::error::{EngineError, Result};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Node identifier, unique within a sequence.
pub type NodeId = u32;

/// A transition from one node to another, optionally guarded by a condition
/// expression. An absent condition is always true.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub source: NodeId,
    pub target: NodeId,
    pub condition: Option<String>,
}

/// A wrapper declaration on a function node: registry name plus argument
/// bindings (name → expression string).
#[derive(Debug, Clone, PartialEq)]
pub struct WrapperSpec {
    pub name: String,
    pub arguments: Vec<(String, String)>,
}

/// The action part of a function node.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionNode {
    /// Registry name of the user function to invoke.
    pub function: String,

    /// Argument bindings, name → expression string.
    pub arguments: Vec<(String, String)>,

    /// Wrappers in declared order; `pre` runs forward, `post` in reverse.
    pub wrappers: Vec<WrapperSpec>,

    /// Per-invocation timeout. `None` defers to the run-level default.
    pub timeout: Option<Duration>,

    /// On-the-fly variable name the return value is bound to.
    pub returns: Option<String>,

    /// Marks a test node: a function failure here fails the whole run
    /// (after the sequence has finished executing).
    pub is_test: bool,
}

/// The action part of a variable node: ordered assignments, each right-hand
/// side an expression string. Earlier assignments are visible to later ones
/// within the same node.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableNode {
    pub assignments: Vec<(String, String)>,
}

/// What a node does when a token reaches it.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    Stop,
    Function(FunctionNode),
    Variable(VariableNode),
    ParallelSplit,
    ParallelSync,
}

impl NodeKind {
    /// Short label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Stop => "stop",
            NodeKind::Function(_) => "function",
            NodeKind::Variable(_) => "variable",
            NodeKind::ParallelSplit => "parallel_split",
            NodeKind::ParallelSync => "parallel_sync",
        }
    }
}

/// An immutable sequence node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: NodeKind,
}

/// A validated, fully-linked sequence graph.
///
/// Construction runs the structural checks; a `Graph` that exists is a graph
/// the scheduler can run (it may still block forever if the author routed a
/// branch around its sync — the engine does not attempt deadlock detection).
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    transitions: HashMap<NodeId, Vec<Transition>>,
    starts: Vec<NodeId>,
    /// Per sync node: the static set of direct source node ids, computed
    /// once so the scheduler's per-color arrival sets have a fixed target.
    expected_arrivals: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl Graph {
    /// Build and validate a graph from its parts.
    ///
    /// Transition order within one source node is preserved; it is the
    /// declared evaluation order.
    pub fn new(nodes: Vec<Node>, transitions: Vec<Transition>) -> Result<Self> {
        let mut node_map: HashMap<NodeId, Node> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node_map.insert(node.id, node.clone()).is_some() {
                return Err(EngineError::validation(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
        }

        let mut transition_map: HashMap<NodeId, Vec<Transition>> = HashMap::new();
        for transition in transitions {
            if !node_map.contains_key(&transition.source) {
                return Err(EngineError::validation(format!(
                    "transition source {} does not exist",
                    transition.source
                )));
            }
            let target = match node_map.get(&transition.target) {
                Some(node) => node,
                None => {
                    return Err(EngineError::validation(format!(
                        "transition target {} does not exist",
                        transition.target
                    )))
                }
            };
            if matches!(target.kind, NodeKind::Start) {
                return Err(EngineError::validation(format!(
                    "transition {} -> {} targets a start node",
                    transition.source, transition.target
                )));
            }
            transition_map
                .entry(transition.source)
                .or_default()
                .push(transition);
        }

        let mut starts = Vec::new();
        let mut stops = 0usize;
        for node in node_map.values() {
            let outgoing = transition_map.get(&node.id).map_or(0, Vec::len);
            match node.kind {
                NodeKind::Start => starts.push(node.id),
                NodeKind::Stop => {
                    stops += 1;
                    if outgoing != 0 {
                        return Err(EngineError::validation(format!(
                            "stop node {} has outgoing transitions",
                            node.id
                        )));
                    }
                }
                _ => {}
            }
            if !matches!(node.kind, NodeKind::Stop) && outgoing == 0 {
                return Err(EngineError::validation(format!(
                    "{} node {} has no outgoing transition",
                    node.kind.label(),
                    node.id
                )));
            }
        }
        if starts.is_empty() {
            return Err(EngineError::validation("no start node"));
        }
        if stops == 0 {
            return Err(EngineError::validation("no stop node"));
        }
        starts.sort_unstable();

        let mut expected_arrivals: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for node in node_map.values() {
            if matches!(node.kind, NodeKind::ParallelSync) {
                expected_arrivals.insert(node.id, BTreeSet::new());
            }
        }
        for transitions in transition_map.values() {
            for transition in transitions {
                if let Some(sources) = expected_arrivals.get_mut(&transition.target) {
                    sources.insert(transition.source);
                }
            }
        }

        Ok(Self {
            nodes: node_map,
            transitions: transition_map,
            starts,
            expected_arrivals,
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Outgoing transitions of a node, in declared order.
    pub fn outgoing(&self, id: NodeId) -> &[Transition] {
        self.transitions.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Ids of all start nodes, ascending.
    pub fn start_nodes(&self) -> &[NodeId] {
        &self.starts
    }

    /// The static arrival set a sync node waits for, per color.
    pub fn expected_arrivals(&self, sync: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.expected_arrivals.get(&sync)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate all nodes in unspecified order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

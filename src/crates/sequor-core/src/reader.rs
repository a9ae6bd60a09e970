//! YAML sequence definitions.
//!
//! The on-disk format mirrors the graph model one-to-one, so a definition
//! survives a serialize/re-parse round trip with identical nodes and
//! transitions. The reader checks the file shape; the structural invariants
//! (start/stop presence, resolvable targets, and so on) are enforced by
//! [`Graph::new`] when the definition is converted.
//!
//! ```yaml
//! name: greet
//! constants:
//!   who: John
//! nodes:
//!   - id: 0
//!     type: start
//!     transitions:
//!       - target: 1
//!   - id: 1
//!     type: function
//!     function: hello
//!     arguments:
//!       name: who
//!     transitions:
//!       - target: 2
//!         condition: "results[1].exception == none"
//!       - target: 3
//!         condition: "results[1].exception != none"
//!   - id: 2
//!     type: stop
//!   - id: 3
//!     type: stop
//! ```

use crate::error::Result;
use crate::graph::{
    FunctionNode, Graph, Node, NodeId, NodeKind, Transition, VariableNode, WrapperSpec,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level sequence definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDef {
    /// Sequence name, used as the run's log target.
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Run constants, fixed before the first token moves.
    #[serde(default)]
    pub constants: IndexMap<String, Value>,

    pub nodes: Vec<NodeDef>,
}

/// One node of the sequence file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: NodeId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: NodeKindDef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDef>,
}

/// The `type`-tagged action part of a node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKindDef {
    Start,
    Stop,
    Function {
        function: String,

        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        arguments: IndexMap<String, String>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        wrappers: Vec<WrapperDef>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        returns: Option<String>,

        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_test: bool,
    },
    Variable {
        /// Ordered assignments; declaration order is evaluation order.
        assign: IndexMap<String, String>,
    },
    ParallelSplit,
    ParallelSync,
}

/// A wrapper declaration on a function node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub arguments: IndexMap<String, String>,
}

/// An outgoing transition of a node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub target: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SequenceDef {
    /// Load a sequence definition from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::EngineError::Load(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_str(&content)
    }

    /// Parse a sequence definition from a YAML string.
    pub fn from_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the definition without building a runnable graph.
    pub fn validate(&self) -> Result<()> {
        self.clone().into_graph().map(|_| ())
    }

    /// Convert into a validated [`Graph`] plus the run constants.
    pub fn into_graph(self) -> Result<(Graph, HashMap<String, Value>)> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut transitions = Vec::new();

        for def in self.nodes {
            for t in &def.transitions {
                transitions.push(Transition {
                    source: def.id,
                    target: t.target,
                    condition: t.condition.clone(),
                });
            }
            let kind = match def.kind {
                NodeKindDef::Start => NodeKind::Start,
                NodeKindDef::Stop => NodeKind::Stop,
                NodeKindDef::ParallelSplit => NodeKind::ParallelSplit,
                NodeKindDef::ParallelSync => NodeKind::ParallelSync,
                NodeKindDef::Variable { assign } => NodeKind::Variable(VariableNode {
                    assignments: assign.into_iter().collect(),
                }),
                NodeKindDef::Function {
                    function,
                    arguments,
                    wrappers,
                    timeout_ms,
                    returns,
                    is_test,
                } => NodeKind::Function(FunctionNode {
                    function,
                    arguments: arguments.into_iter().collect(),
                    wrappers: wrappers
                        .into_iter()
                        .map(|w| WrapperSpec {
                            name: w.name,
                            arguments: w.arguments.into_iter().collect(),
                        })
                        .collect(),
                    timeout: timeout_ms.map(Duration::from_millis),
                    returns,
                    is_test,
                }),
            };
            nodes.push(Node {
                id: def.id,
                name: def.name,
                kind,
            });
        }

        let graph = Graph::new(nodes, transitions)?;
        let constants = self.constants.into_iter().collect();
        Ok((graph, constants))
    }
}

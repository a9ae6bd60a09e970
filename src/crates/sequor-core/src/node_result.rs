//! Per-node execution result records.
//!
//! After a function node runs, its outcome is committed into the result
//! registry and becomes readable from expressions as `results[<id>]`. The
//! record keeps the last run only; a looped node overwrites its slot.
//!
//! `Option` fields serialize as explicit `null` (no skipping), so conditions
//! can test for absence with `results[3].exception == none`.

use crate::graph::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured description of a failure raised by a user function or wrapper.
///
/// User callables signal failure with a name and a map of named arguments;
/// both are preserved verbatim so conditions can dispatch on them
/// (`results[1].exception.function.name == "IoError"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrInfo {
    /// Error name, e.g. `"IoError"` or the synthetic `"Timeout"`.
    pub name: String,

    /// Named arguments carried by the error.
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ErrInfo {
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
}

/// The two failure channels of a function-node execution.
///
/// `function` holds the user function's own failure (or the synthetic timeout
/// or argument-evaluation error); `wrappers` holds the first failure raised
/// by a wrapper `pre` or `post`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub function: Option<ErrInfo>,
    pub wrappers: Option<ErrInfo>,
}

impl ExceptionInfo {
    pub fn is_empty(&self) -> bool {
        self.function.is_none() && self.wrappers.is_none()
    }

    /// Combine the two channels into one record, or `None` if both are clear.
    pub fn combine(function: Option<ErrInfo>, wrappers: Option<ErrInfo>) -> Option<Self> {
        if function.is_none() && wrappers.is_none() {
            None
        } else {
            Some(Self { function, wrappers })
        }
    }
}

/// Result of the most recent execution of a function node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Id of the node this result belongs to.
    pub nid: NodeId,

    /// Value returned by the user function; `None` when it failed or was
    /// skipped because a wrapper `pre` failed.
    pub returned: Option<Value>,

    /// Failure record, or `None` when both the function and its wrappers
    /// completed cleanly.
    pub exception: Option<ExceptionInfo>,
}

impl NodeResult {
    /// A clean result carrying the function's return value.
    pub fn success(nid: NodeId, returned: Value) -> Self {
        Self {
            nid,
            returned: Some(returned),
            exception: None,
        }
    }

    /// Whether the function sub-exception is present.
    ///
    /// This is the signal `is_test` nodes use to fail the run.
    pub fn function_failed(&self) -> bool {
        self.exception
            .as_ref()
            .is_some_and(|e| e.function.is_some())
    }

    /// Whether any failure was recorded.
    pub fn failed(&self) -> bool {
        self.exception.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_result_has_no_exception() {
        let result = NodeResult::success(4, json!("ok"));
        assert_eq!(result.nid, 4);
        assert_eq!(result.returned, Some(json!("ok")));
        assert!(!result.failed());
        assert!(!result.function_failed());
    }

    #[test]
    fn test_combine_drops_empty_record() {
        assert_eq!(ExceptionInfo::combine(None, None), None);

        let combined = ExceptionInfo::combine(Some(ErrInfo::new("Boom")), None).unwrap();
        assert_eq!(combined.function.as_ref().unwrap().name, "Boom");
        assert!(combined.wrappers.is_none());
    }

    #[test]
    fn test_absent_fields_serialize_as_null() {
        let result = NodeResult {
            nid: 7,
            returned: None,
            exception: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"nid": 7, "returned": null, "exception": null}));
    }

    #[test]
    fn test_err_info_args_round_trip() {
        let err = ErrInfo::new("Timeout").with_arg("timeout_ms", json!(100));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["name"], "Timeout");
        assert_eq!(value["args"]["timeout_ms"], 100);

        let back: ErrInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}

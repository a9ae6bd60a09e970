//! Per-node-kind execution.
//!
//! Function nodes run on worker tasks through [`execute_function`], which
//! owns the whole invocation pipeline: wrapper construction, `pre` calls,
//! argument evaluation, the user function with its timeout, and `post`
//! calls. Variable nodes are applied directly on the coordinator through
//! [`apply_variable_node`] since they never invoke user code.

use crate::error::{EngineError, Result};
use crate::expr::{self, EvalError};
use crate::functions::{FnError, Invocation, SequenceFn, Wrapper, WrapperFactory};
use crate::graph::{FunctionNode, NodeId, VariableNode, WrapperSpec};
use crate::node_result::{ErrInfo, ExceptionInfo, NodeResult};
use crate::vars::{Env, VariableStore};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a worker needs to run one function node, resolved by the
/// coordinator at dispatch time.
pub(crate) struct FunctionCall {
    pub node_id: NodeId,
    pub spec: FunctionNode,
    pub env: Env,
    pub function: SequenceFn,
    /// Wrapper specs paired with their factories, in declared order.
    pub wrappers: Vec<(WrapperSpec, WrapperFactory)>,
    /// Effective timeout: the node's own, or the run default.
    pub timeout: Option<Duration>,
    /// Child token for this invocation; cancelled on timeout and on
    /// run-level cancel.
    pub cancel: CancellationToken,
}

fn eval_err_info(err: &EvalError, expression: &str) -> ErrInfo {
    ErrInfo::new("EvalError")
        .with_arg("message", Value::from(err.to_string()))
        .with_arg("expression", Value::from(expression))
}

/// Run one function-node invocation to completion.
///
/// Never returns an engine error: everything that can go wrong here is
/// captured into the returned [`NodeResult`] so the sequence can branch
/// on it.
#[tracing::instrument(
    skip(call),
    fields(node = call.node_id, function = %call.spec.function)
)]
pub(crate) async fn execute_function(call: FunctionCall) -> NodeResult {
    let mut wrapper_err: Option<ErrInfo> = None;
    let mut function_err: Option<ErrInfo> = None;
    let mut returned: Option<Value> = None;

    // Construct wrappers with their evaluated arguments.
    let mut wrappers: Vec<(String, Box<dyn Wrapper>)> = Vec::with_capacity(call.wrappers.len());
    for (spec, factory) in &call.wrappers {
        match eval_bindings(&spec.arguments, &call.env) {
            Ok(args) => wrappers.push((spec.name.clone(), factory(args, call.cancel.clone()))),
            Err((err, expression)) => {
                wrapper_err = Some(eval_err_info(&err, &expression));
                break;
            }
        }
    }

    // Run `pre` in declared order, capturing each return value under the
    // wrapper's name. A failure skips the remaining `pre`s and the user
    // function; `post` still runs for the wrappers whose `pre` completed.
    let mut pre_values = Map::new();
    let mut pre_completed = 0usize;
    if wrapper_err.is_none() {
        for (name, wrapper) in wrappers.iter_mut() {
            match wrapper.pre().await {
                Ok(value) => {
                    pre_values.insert(name.clone(), value);
                    pre_completed += 1;
                }
                Err(err) => {
                    tracing::debug!(wrapper = %name, error = %err, "wrapper pre failed");
                    wrapper_err = Some(err.into());
                    break;
                }
            }
        }
    }

    if wrapper_err.is_none() {
        // The wrapper-local map is visible to this invocation's argument
        // bindings only; it never reaches the variable store.
        let env = call.env.clone().with_binding("wrappers", Value::Object(pre_values));
        match eval_bindings(&call.spec.arguments, &env) {
            Err((err, expression)) => {
                function_err = Some(eval_err_info(&err, &expression));
            }
            Ok(args) => {
                let invocation = Invocation {
                    args,
                    cancel: call.cancel.clone(),
                };
                let fut = (call.function)(invocation);
                let outcome = match call.timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // Dropping the future is the interrupt; the
                            // token also tells anything it spawned to stop.
                            call.cancel.cancel();
                            tracing::debug!(timeout_ms = limit.as_millis() as u64, "function timed out");
                            Err(FnError::new("Timeout")
                                .with_arg("timeout_ms", Value::from(limit.as_millis() as u64)))
                        }
                    },
                    None => fut.await,
                };
                match outcome {
                    Ok(value) => returned = Some(value),
                    Err(err) => {
                        tracing::debug!(error = %err, "function raised");
                        function_err = Some(err.into());
                    }
                }
            }
        }
    }

    // `post` in reverse declared order, only for completed `pre`s. The
    // first wrapper error wins; later ones are logged.
    for (name, wrapper) in wrappers.iter_mut().take(pre_completed).rev() {
        if let Err(err) = wrapper.post().await {
            if wrapper_err.is_none() {
                wrapper_err = Some(err.into());
            } else {
                tracing::warn!(wrapper = %name, error = %err, "wrapper post failed after earlier wrapper error");
            }
        }
    }

    NodeResult {
        nid: call.node_id,
        returned,
        exception: ExceptionInfo::combine(function_err, wrapper_err),
    }
}

/// Evaluate a set of argument bindings against an environment.
///
/// On failure, returns the error together with the offending expression so
/// the caller can report it.
fn eval_bindings(
    bindings: &[(String, String)],
    env: &Env,
) -> std::result::Result<Map<String, Value>, (EvalError, String)> {
    let mut args = Map::with_capacity(bindings.len());
    for (name, expression) in bindings {
        let value = expr::evaluate(expression, env).map_err(|e| (e, expression.clone()))?;
        args.insert(name.clone(), value);
    }
    Ok(args)
}

/// Apply a variable node's assignments in declared order.
///
/// Each assignment re-snapshots the store so earlier assignments of the same
/// node are visible to later right-hand sides. Any failure is fatal: there
/// is no owning result record to branch on.
pub(crate) fn apply_variable_node(
    node_id: NodeId,
    spec: &VariableNode,
    store: &mut VariableStore,
) -> Result<()> {
    for (name, expression) in &spec.assignments {
        let env = store.snapshot();
        let value = expr::evaluate(expression, &env).map_err(|e| {
            EngineError::eval(format!("assignment '{name}' of node {node_id}"), e)
        })?;
        tracing::trace!(node = node_id, variable = %name, "variable assigned");
        store.set_on_the_fly(name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingWrapper {
        label: String,
        journal: Journal,
        fail_pre: bool,
        fail_post: bool,
    }

    #[async_trait]
    impl Wrapper for RecordingWrapper {
        async fn pre(&mut self) -> std::result::Result<Value, FnError> {
            self.journal.lock().unwrap().push(format!("pre:{}", self.label));
            if self.fail_pre {
                return Err(FnError::new("PreBoom"));
            }
            Ok(json!(format!("{}-ready", self.label)))
        }

        async fn post(&mut self) -> std::result::Result<(), FnError> {
            self.journal.lock().unwrap().push(format!("post:{}", self.label));
            if self.fail_post {
                return Err(FnError::new("PostBoom"));
            }
            Ok(())
        }
    }

    fn recording_factory(journal: Journal, fail_pre: bool, fail_post: bool) -> WrapperFactory {
        Arc::new(move |args, _cancel| {
            let label = args
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("w")
                .to_string();
            Box::new(RecordingWrapper {
                label,
                journal: journal.clone(),
                fail_pre,
                fail_post,
            })
        })
    }

    fn wrapper_spec(name: &str, label: &str) -> WrapperSpec {
        WrapperSpec {
            name: name.to_string(),
            arguments: vec![("label".to_string(), format!("'{label}'"))],
        }
    }

    fn echo_fn() -> SequenceFn {
        Arc::new(|inv: Invocation| {
            Box::pin(async move {
                Ok(inv.arg("value").cloned().unwrap_or(Value::Null))
            }) as crate::functions::FnFuture
        })
    }

    fn call(spec: FunctionNode, function: SequenceFn, wrappers: Vec<(WrapperSpec, WrapperFactory)>) -> FunctionCall {
        FunctionCall {
            node_id: 1,
            spec,
            env: Env::default(),
            function,
            wrappers,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    fn fn_node(arguments: Vec<(String, String)>, wrappers: Vec<WrapperSpec>) -> FunctionNode {
        FunctionNode {
            function: "test".to_string(),
            arguments,
            wrappers,
            timeout: None,
            returns: None,
            is_test: false,
        }
    }

    #[tokio::test]
    async fn test_pre_order_and_post_reverse_order() {
        let journal: Journal = Default::default();
        let wrappers = vec![
            (wrapper_spec("first", "a"), recording_factory(journal.clone(), false, false)),
            (wrapper_spec("second", "b"), recording_factory(journal.clone(), false, false)),
        ];
        let spec = fn_node(vec![("value".to_string(), "1".to_string())], vec![
            wrapper_spec("first", "a"),
            wrapper_spec("second", "b"),
        ]);

        let result = execute_function(call(spec, echo_fn(), wrappers)).await;
        assert!(!result.failed());
        assert_eq!(
            *journal.lock().unwrap(),
            ["pre:a", "pre:b", "post:b", "post:a"]
        );
    }

    #[tokio::test]
    async fn test_wrapper_values_visible_in_argument_bindings() {
        let journal: Journal = Default::default();
        let wrappers = vec![(
            wrapper_spec("timer", "t"),
            recording_factory(journal, false, false),
        )];
        let spec = fn_node(
            vec![("value".to_string(), "wrappers.timer".to_string())],
            vec![wrapper_spec("timer", "t")],
        );

        let result = execute_function(call(spec, echo_fn(), wrappers)).await;
        assert_eq!(result.returned, Some(json!("t-ready")));
    }

    #[tokio::test]
    async fn test_pre_failure_skips_function_and_later_pres() {
        let journal: Journal = Default::default();
        let wrappers = vec![
            (wrapper_spec("ok", "a"), recording_factory(journal.clone(), false, false)),
            (wrapper_spec("bad", "b"), recording_factory(journal.clone(), true, false)),
            (wrapper_spec("never", "c"), recording_factory(journal.clone(), false, false)),
        ];
        let spec = fn_node(vec![("value".to_string(), "1".to_string())], vec![
            wrapper_spec("ok", "a"),
            wrapper_spec("bad", "b"),
            wrapper_spec("never", "c"),
        ]);

        let result = execute_function(call(spec, echo_fn(), wrappers)).await;
        assert_eq!(result.returned, None);
        let exception = result.exception.unwrap();
        assert_eq!(exception.wrappers.unwrap().name, "PreBoom");
        assert!(exception.function.is_none());
        // Only the wrapper whose pre completed gets its post.
        assert_eq!(*journal.lock().unwrap(), ["pre:a", "pre:b", "post:a"]);
    }

    #[tokio::test]
    async fn test_post_error_does_not_override_pre_error() {
        let journal: Journal = Default::default();
        let wrappers = vec![
            (wrapper_spec("posty", "a"), recording_factory(journal.clone(), false, true)),
            (wrapper_spec("prey", "b"), recording_factory(journal.clone(), true, false)),
        ];
        let spec = fn_node(vec![], vec![
            wrapper_spec("posty", "a"),
            wrapper_spec("prey", "b"),
        ]);

        let result = execute_function(call(spec, echo_fn(), wrappers)).await;
        let exception = result.exception.unwrap();
        assert_eq!(exception.wrappers.unwrap().name, "PreBoom");
    }

    #[tokio::test]
    async fn test_timeout_records_synthetic_error_and_runs_post() {
        let journal: Journal = Default::default();
        let wrappers = vec![(
            wrapper_spec("timer", "t"),
            recording_factory(journal.clone(), false, false),
        )];
        let slow: SequenceFn = Arc::new(|_inv| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }) as crate::functions::FnFuture
        });
        let spec = fn_node(vec![], vec![wrapper_spec("timer", "t")]);

        let mut call = call(spec, slow, wrappers);
        call.timeout = Some(Duration::from_millis(20));
        let cancel = call.cancel.clone();

        let result = execute_function(call).await;
        let function = result.exception.unwrap().function.unwrap();
        assert_eq!(function.name, "Timeout");
        assert_eq!(function.args["timeout_ms"], json!(20));
        assert!(cancel.is_cancelled());
        assert_eq!(*journal.lock().unwrap(), ["pre:t", "post:t"]);
    }

    #[tokio::test]
    async fn test_argument_eval_error_is_function_exception() {
        let spec = fn_node(
            vec![("value".to_string(), "no_such_name".to_string())],
            vec![],
        );
        let result = execute_function(call(spec, echo_fn(), vec![])).await;
        let function = result.exception.unwrap().function.unwrap();
        assert_eq!(function.name, "EvalError");
        assert_eq!(function.args["expression"], json!("no_such_name"));
    }

    #[test]
    fn test_variable_node_sees_its_own_earlier_assignments() {
        let mut store = VariableStore::new(HashMap::new(), "seq").unwrap();
        let spec = VariableNode {
            assignments: vec![
                ("x".to_string(), "2".to_string()),
                ("y".to_string(), "x * 10".to_string()),
            ],
        };
        apply_variable_node(5, &spec, &mut store).unwrap();
        assert_eq!(store.on_the_fly()["y"], json!(20));
    }

    #[test]
    fn test_variable_node_protected_write_is_fatal() {
        let mut store = VariableStore::new(HashMap::new(), "seq").unwrap();
        let spec = VariableNode {
            assignments: vec![("results".to_string(), "1".to_string())],
        };
        assert!(matches!(
            apply_variable_node(5, &spec, &mut store),
            Err(EngineError::ProtectedWrite { .. })
        ));
    }

    #[test]
    fn test_variable_node_eval_error_is_fatal() {
        let mut store = VariableStore::new(HashMap::new(), "seq").unwrap();
        let spec = VariableNode {
            assignments: vec![("x".to_string(), "missing + 1".to_string())],
        };
        assert!(matches!(
            apply_variable_node(5, &spec, &mut store),
            Err(EngineError::Eval { .. })
        ));
    }
}

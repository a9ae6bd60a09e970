//! End-to-end runs of complete sequences.
//!
//! These tests drive the whole stack: YAML reader, graph validation,
//! scheduler, worker pool, wrappers, and the runner API.

use async_trait::async_trait;
use sequor_core::{
    FnError, FnFuture, FunctionRegistry, Invocation, RunOptions, RunOutcome, RunState, RunStatus,
    Runner, SequenceDef, Wrapper, WrapperRegistry,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

/// Functions shared by the scenarios below.
fn test_functions() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register("hello", |inv: Invocation| {
        Box::pin(async move {
            let name = inv.required("name")?.as_str().unwrap_or("?").to_string();
            Ok(json!(format!("Hello, {name}!")))
        }) as FnFuture
    });

    registry.register("list_path", |inv: Invocation| {
        Box::pin(async move {
            let path = inv.required("path")?.as_str().unwrap_or("").to_string();
            let entries = std::fs::read_dir(&path).map_err(|e| {
                FnError::new("IoError")
                    .with_arg("path", json!(path))
                    .with_arg("message", json!(e.to_string()))
            })?;
            let names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            Ok(json!(names))
        }) as FnFuture
    });

    registry.register("echo", |inv: Invocation| {
        Box::pin(async move { Ok(inv.arg("value").cloned().unwrap_or(Value::Null)) }) as FnFuture
    });

    registry.register("boom", |_inv: Invocation| {
        Box::pin(async move { Err::<Value, _>(FnError::new("Boom")) }) as FnFuture
    });

    registry.register("sleep_ms", |inv: Invocation| {
        Box::pin(async move {
            let ms = inv.required("ms")?.as_u64().unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!(ms)),
                _ = inv.cancel.cancelled() => Err(FnError::new("Cancelled")),
            }
        }) as FnFuture
    });

    registry.register("mutate_list", |inv: Invocation| {
        Box::pin(async move {
            let mut values = inv.required("values")?.clone();
            if let Some(list) = values.as_array_mut() {
                list.push(json!(3));
            }
            Ok(values)
        }) as FnFuture
    });

    registry
}

struct JournalWrapper {
    label: String,
    journal: Journal,
}

#[async_trait]
impl Wrapper for JournalWrapper {
    async fn pre(&mut self) -> Result<Value, FnError> {
        self.journal.lock().unwrap().push(format!("pre:{}", self.label));
        Ok(json!(self.label.clone()))
    }

    async fn post(&mut self) -> Result<(), FnError> {
        self.journal.lock().unwrap().push(format!("post:{}", self.label));
        Ok(())
    }
}

fn journal_wrappers(journal: Journal) -> WrapperRegistry {
    let mut registry = WrapperRegistry::new();
    registry.register("journal", move |args, _cancel| {
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("w")
            .to_string();
        Box::new(JournalWrapper {
            label,
            journal: journal.clone(),
        }) as Box<dyn Wrapper>
    });
    registry
}

async fn run_sequence(yaml: &str, functions: FunctionRegistry, wrappers: WrapperRegistry) -> RunOutcome {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let def = SequenceDef::from_str(yaml).expect("sequence parses");
    let runner = Runner::from_sequence(def, functions, wrappers, RunOptions::default())
        .expect("sequence validates");
    tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .expect("run terminates")
}

fn assert_tokens_balanced(outcome: &RunOutcome) {
    assert_eq!(
        outcome.stats.tokens_created, outcome.stats.tokens_consumed,
        "every created token must be executed or absorbed"
    );
}

#[tokio::test]
async fn test_linear_sequence() {
    let yaml = r#"
name: linear
constants:
  who: John
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: list_path
    arguments: { path: "'/tmp'" }
    transitions: [{ target: 2 }]
  - id: 2
    type: function
    function: hello
    arguments: { name: who }
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.result(1).unwrap().exception.is_none());
    assert!(outcome.result(2).unwrap().exception.is_none());
    assert_eq!(
        outcome.result(2).unwrap().returned,
        Some(json!("Hello, John!"))
    );
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_conditional_branch_on_error() {
    let yaml = r#"
name: branch_on_error
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: list_path
    arguments: { path: "'/definitely/not/here'" }
    transitions:
      - target: 2
        condition: "results[1].exception == none"
      - target: 3
        condition: "results[1].exception != none"
  - id: 2
    type: function
    function: hello
    arguments: { name: "'never'" }
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.result(2).is_none(), "error branch must skip node 2");
    let exception = outcome.result(1).unwrap().exception.as_ref().unwrap();
    assert_eq!(exception.function.as_ref().unwrap().name, "IoError");
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_parallel_split_and_sync() {
    let yaml = r#"
name: fan_out
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: parallel_split
    transitions:
      - target: 2
      - target: 3
  - id: 2
    type: function
    function: sleep_ms
    arguments: { ms: "20" }
    transitions: [{ target: 4 }]
  - id: 3
    type: function
    function: sleep_ms
    arguments: { ms: "5" }
    transitions: [{ target: 4 }]
  - id: 4
    type: parallel_sync
    transitions: [{ target: 5 }]
  - id: 5
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.result(2).is_some(), "both branches must run");
    assert!(outcome.result(3).is_some(), "both branches must run");
    assert_eq!(outcome.stats.sync_firings, 1, "the sync fires exactly once");
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_looped_split_fires_sync_once_per_wave() {
    // The loop re-enters the split three times; branch delays are skewed so
    // arrivals interleave differently per wave. Colors must pair each split
    // firing with exactly one sync firing.
    let yaml = r#"
name: looped_fan_out
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: variable
    assign: { i: "0" }
    transitions: [{ target: 2 }]
  - id: 2
    type: parallel_split
    transitions:
      - target: 3
      - target: 4
  - id: 3
    type: function
    function: sleep_ms
    arguments: { ms: "15" }
    transitions: [{ target: 5 }]
  - id: 4
    type: function
    function: sleep_ms
    arguments: { ms: "1" }
    transitions: [{ target: 5 }]
  - id: 5
    type: parallel_sync
    transitions: [{ target: 6 }]
  - id: 6
    type: variable
    assign: { i: "i + 1" }
    transitions:
      - target: 2
        condition: "i < 3"
      - target: 7
  - id: 7
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.variables["i"], json!(3));
    assert_eq!(outcome.stats.sync_firings, 3, "one sync firing per wave");
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_nested_splits_stack_colors() {
    let yaml = r#"
name: nested_fan_out
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: parallel_split
    transitions:
      - target: 2
      - target: 6
  - id: 2
    type: parallel_split
    transitions:
      - target: 3
      - target: 4
  - id: 3
    type: function
    function: sleep_ms
    arguments: { ms: "10" }
    transitions: [{ target: 5 }]
  - id: 4
    type: function
    function: sleep_ms
    arguments: { ms: "2" }
    transitions: [{ target: 5 }]
  - id: 5
    type: parallel_sync
    transitions: [{ target: 7 }]
  - id: 6
    type: function
    function: sleep_ms
    arguments: { ms: "4" }
    transitions: [{ target: 7 }]
  - id: 7
    type: parallel_sync
    transitions: [{ target: 8 }]
  - id: 8
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stats.sync_firings, 2, "inner and outer sync each fire once");
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_timeout_records_error_and_branches_on_it() {
    let journal: Journal = Default::default();
    let yaml = r#"
name: slowpoke
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: sleep_ms
    arguments: { ms: "500" }
    timeout_ms: 50
    wrappers:
      - name: journal
        arguments: { label: "'t'" }
    transitions:
      - target: 2
        condition: "results[1].exception != none"
      - target: 3
  - id: 2
    type: variable
    assign: { outcome: "'timed_out'" }
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), journal_wrappers(journal.clone())).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let function = outcome
        .result(1)
        .unwrap()
        .exception
        .as_ref()
        .unwrap()
        .function
        .as_ref()
        .unwrap();
    assert_eq!(function.name, "Timeout");
    assert_eq!(function.args["timeout_ms"], json!(50));
    assert_eq!(outcome.variables["outcome"], json!("timed_out"));
    // post still runs after the timeout.
    assert_eq!(*journal.lock().unwrap(), ["pre:t", "post:t"]);
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_failing_test_node_fails_the_run_but_not_the_flow() {
    let yaml = r#"
name: failing_check
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: boom
    is_test: true
    transitions: [{ target: 2 }]
  - id: 2
    type: function
    function: hello
    arguments: { name: "'still here'" }
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::TestFailed);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.failed_tests.len(), 1);
    assert_eq!(outcome.failed_tests[0].nid, 1);
    assert_eq!(
        outcome.failed_tests[0]
            .exception
            .as_ref()
            .unwrap()
            .function
            .as_ref()
            .unwrap()
            .name,
        "Boom"
    );
    // The sequence keeps going after a failed test node.
    assert!(outcome.result(2).is_some());
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_no_transition_fired_is_fatal() {
    let yaml = r#"
name: dead_end
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: echo
    arguments: { value: "1" }
    transitions:
      - target: 2
        condition: "false"
      - target: 2
        condition: "1 > 2"
  - id: 2
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Error);
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(outcome.fatal.as_ref().unwrap().name, "NoTransitionFired");
}

#[tokio::test]
async fn test_wrapper_values_scoped_to_their_invocation() {
    let journal: Journal = Default::default();
    // Node 1 reads its wrapper's pre value through the `wrappers` binding;
    // the transition leaving it must no longer see that binding.
    let yaml = r#"
name: wrapper_scope
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: echo
    arguments: { value: "wrappers.journal" }
    wrappers:
      - name: journal
        arguments: { label: "'scoped'" }
    transitions:
      - target: 2
        condition: "wrappers != none"
      - target: 2
  - id: 2
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), journal_wrappers(journal)).await;

    // Inside the node the binding resolved to the pre value...
    assert_eq!(outcome.result(1).unwrap().returned, Some(json!("scoped")));
    // ...but the transition condition referencing it is a fatal eval error.
    assert_eq!(outcome.status, RunStatus::Error);
    assert_eq!(outcome.fatal.as_ref().unwrap().name, "EvalError");
}

#[tokio::test]
async fn test_independent_branch_writes_survive_interleaving() {
    let yaml = r#"
name: two_writers
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: parallel_split
    transitions:
      - target: 2
      - target: 4
  - id: 2
    type: function
    function: sleep_ms
    arguments: { ms: "8" }
    transitions: [{ target: 3 }]
  - id: 3
    type: variable
    assign: { a: "'left'" }
    transitions: [{ target: 6 }]
  - id: 4
    type: function
    function: sleep_ms
    arguments: { ms: "1" }
    transitions: [{ target: 5 }]
  - id: 5
    type: variable
    assign: { b: "'right'" }
    transitions: [{ target: 6 }]
  - id: 6
    type: parallel_sync
    transitions: [{ target: 7 }]
  - id: 7
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.variables["a"], json!("left"));
    assert_eq!(outcome.variables["b"], json!("right"));
    assert_tokens_balanced(&outcome);
}

#[tokio::test]
async fn test_function_argument_mutation_is_isolated() {
    let yaml = r#"
name: isolation
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: variable
    assign: { xs: "[1, 2]" }
    transitions: [{ target: 2 }]
  - id: 2
    type: function
    function: mutate_list
    arguments: { values: "xs" }
    returns: ys
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.variables["xs"], json!([1, 2]), "sequence variable untouched");
    assert_eq!(outcome.variables["ys"], json!([1, 2, 3]), "returns alias bound");
}

#[tokio::test]
async fn test_cancellation_drains_and_reports() {
    let yaml = r#"
name: long_haul
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: sleep_ms
    arguments: { ms: "60000" }
    transitions: [{ target: 2 }]
  - id: 2
    type: function
    function: hello
    arguments: { name: "'never'" }
    transitions: [{ target: 3 }]
  - id: 3
    type: stop
"#;
    let def = SequenceDef::from_str(yaml).unwrap();
    let runner = Runner::from_sequence(
        def,
        test_functions(),
        WrapperRegistry::new(),
        RunOptions::default().with_drain_deadline(Duration::from_secs(2)),
    )
    .unwrap();

    let handle = runner.run_async();
    assert_eq!(handle.status(), RunState::Running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run drains promptly");

    assert!(outcome.cancelled);
    assert_eq!(outcome.status, RunStatus::Completed, "no fatal error, no failed test");
    // The sleeper observed the cancel and reported it as its failure.
    let exception = outcome.result(1).unwrap().exception.as_ref().unwrap();
    assert_eq!(exception.function.as_ref().unwrap().name, "Cancelled");
    // Node 2 never dispatched.
    assert!(outcome.result(2).is_none());
}

#[tokio::test]
async fn test_first_true_transition_wins() {
    let yaml = r#"
name: first_wins
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: echo
    arguments: { value: "10" }
    transitions:
      - target: 2
        condition: "results[1].returned >= 5"
      - target: 3
        condition: "results[1].returned >= 0"
  - id: 2
    type: variable
    assign: { picked: "'high'" }
    transitions: [{ target: 4 }]
  - id: 3
    type: variable
    assign: { picked: "'low'" }
    transitions: [{ target: 4 }]
  - id: 4
    type: stop
"#;
    let outcome = run_sequence(yaml, test_functions(), WrapperRegistry::new()).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.variables["picked"], json!("high"));
}

#[tokio::test]
async fn test_default_timeout_applies_to_undeclared_nodes() {
    let yaml = r#"
name: default_budget
nodes:
  - id: 0
    type: start
    transitions: [{ target: 1 }]
  - id: 1
    type: function
    function: sleep_ms
    arguments: { ms: "5000" }
    transitions:
      - target: 2
  - id: 2
    type: stop
"#;
    let def = SequenceDef::from_str(yaml).unwrap();
    let runner = Runner::from_sequence(
        def,
        test_functions(),
        WrapperRegistry::new(),
        RunOptions::default().with_default_timeout(Duration::from_millis(30)),
    )
    .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), runner.run())
        .await
        .expect("run terminates");

    let function = outcome
        .result(1)
        .unwrap()
        .exception
        .as_ref()
        .unwrap()
        .function
        .as_ref()
        .unwrap();
    assert_eq!(function.name, "Timeout");
    assert_eq!(outcome.status, RunStatus::Completed);
}

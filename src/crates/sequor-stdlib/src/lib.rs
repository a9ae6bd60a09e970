//! Ready-made sequence functions and wrappers.
//!
//! Sequences call externally-provided functions; this crate ships a small
//! set of general-purpose ones so simple sequences (and demos and tests)
//! need no custom code:
//!
//! | Function | Arguments | Returns |
//! |---|---|---|
//! | `hello` | `name` | greeting string |
//! | `echo` | `value` | the value, unchanged |
//! | `list_path` | `path` | file names in the directory |
//! | `sleep_ms` | `ms` | the slept duration; honors cancellation |
//! | `fail_with` | `name` | always raises an error with that name |
//!
//! Wrappers: `stopwatch` (pre captures a start timestamp, post logs the
//! elapsed time) and `announce` (logs entry and exit of the wrapped
//! function).
//!
//! Build preloaded registries with [`functions`] and [`wrappers`], or
//! register a subset by hand.

use async_trait::async_trait;
use chrono::Utc;
use sequor_core::{
    FnError, FnFuture, FunctionRegistry, Invocation, Wrapper, WrapperRegistry,
};
use serde_json::{json, Value};
use std::time::Duration;

/// A registry preloaded with every function in this crate.
pub fn functions() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register("hello", hello);
    registry.register("echo", echo);
    registry.register("list_path", list_path);
    registry.register("sleep_ms", sleep_ms);
    registry.register("fail_with", fail_with);
    registry
}

/// A registry preloaded with every wrapper in this crate.
pub fn wrappers() -> WrapperRegistry {
    let mut registry = WrapperRegistry::new();
    registry.register("stopwatch", |args, _cancel| {
        Box::new(Stopwatch {
            label: label_from(&args),
            started_ms: 0,
        }) as Box<dyn Wrapper>
    });
    registry.register("announce", |args, _cancel| {
        Box::new(Announce {
            label: label_from(&args),
        }) as Box<dyn Wrapper>
    });
    registry
}

fn label_from(args: &serde_json::Map<String, Value>) -> String {
    args.get("label")
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
        .to_string()
}

fn hello(inv: Invocation) -> FnFuture {
    Box::pin(async move {
        let name = inv.required("name")?.as_str().unwrap_or("world").to_string();
        Ok(json!(format!("Hello, {name}!")))
    })
}

fn echo(inv: Invocation) -> FnFuture {
    Box::pin(async move { Ok(inv.arg("value").cloned().unwrap_or(Value::Null)) })
}

/// List the file names in a directory.
///
/// Raises `IoError` with the path and the OS message when the directory
/// cannot be read.
fn list_path(inv: Invocation) -> FnFuture {
    Box::pin(async move {
        let path = inv.required("path")?.as_str().unwrap_or("").to_string();
        let entries = std::fs::read_dir(&path).map_err(|e| {
            FnError::new("IoError")
                .with_arg("path", json!(path.clone()))
                .with_arg("message", json!(e.to_string()))
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(json!(names))
    })
}

/// Sleep for `ms` milliseconds, waking early on cancellation.
fn sleep_ms(inv: Invocation) -> FnFuture {
    Box::pin(async move {
        let ms = inv.required("ms")?.as_u64().ok_or_else(|| {
            FnError::with_message("BadArgument", "'ms' must be a non-negative integer")
        })?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!(ms)),
            _ = inv.cancel.cancelled() => {
                Err(FnError::new("Cancelled").with_arg("after_ms", json!(ms)))
            }
        }
    })
}

/// Always fail, with the error name taken from the `name` argument.
///
/// Handy for exercising error branches of a sequence without touching
/// anything real.
fn fail_with(inv: Invocation) -> FnFuture {
    Box::pin(async move {
        let name = inv.required("name")?.as_str().unwrap_or("Failure").to_string();
        Err::<Value, _>(FnError::new(name))
    })
}

struct Stopwatch {
    label: String,
    started_ms: i64,
}

#[async_trait]
impl Wrapper for Stopwatch {
    async fn pre(&mut self) -> Result<Value, FnError> {
        self.started_ms = Utc::now().timestamp_millis();
        Ok(json!(self.started_ms))
    }

    async fn post(&mut self) -> Result<(), FnError> {
        let elapsed = Utc::now().timestamp_millis() - self.started_ms;
        tracing::info!(label = %self.label, elapsed_ms = elapsed, "stopwatch");
        Ok(())
    }
}

struct Announce {
    label: String,
}

#[async_trait]
impl Wrapper for Announce {
    async fn pre(&mut self) -> Result<Value, FnError> {
        tracing::info!(label = %self.label, "entering");
        Ok(json!(self.label.clone()))
    }

    async fn post(&mut self) -> Result<(), FnError> {
        tracing::info!(label = %self.label, "leaving");
        Ok(())
    }
}

//! Sandboxed script execution -- fresh engine per run, hard wall-clock timeout.
//!
//! Validation and pre/after scripts are untrusted input. Each run gets its own
//! `rhai` engine with no filesystem, network, or host-state access; the only
//! bridge to the host is the injected context and the message sink. A deadline
//! checked from the engine's progress callback aborts runaway scripts.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use thiserror::Error;

/// Hard wall-clock limit for a single script run.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script exceeded the {}ms execution limit", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Eval(String),

    #[error("script worker failed: {0}")]
    Worker(String),
}

/// Values injected into the script's scope. Absent members appear as `()`.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    /// Realized response (`status`, `statusText`, `header`, `body`); absent
    /// for pre-scripts, which run before the call.
    pub response: Option<Value>,
    /// Resolved request parameters of the current case.
    pub params: Value,
    /// Records of cases already executed this run, keyed by case id.
    pub records: Value,
    /// Flattened environment global variables.
    pub global: Value,
    /// Mutable request options; provided to pre-scripts only.
    pub options: Option<Value>,
}

/// Output of one script run.
#[derive(Debug, Default)]
pub struct ScriptOutcome {
    /// Messages recorded via `assert`, `log`, and `print`.
    pub messages: Vec<String>,
    /// Final state of `options` when the context provided one.
    pub options: Option<Value>,
}

/// Executor for untrusted scripts. Cheap to clone; holds only the timeout.
#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SCRIPT_TIMEOUT_MS))
    }
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `script` against `ctx` in a fresh engine on a blocking thread, so a
    /// hot loop cannot stall the async runtime while the deadline winds down.
    pub async fn run(
        &self,
        script: &str,
        ctx: ScriptContext,
    ) -> Result<ScriptOutcome, ScriptError> {
        let timeout = self.timeout;
        let script = script.to_string();
        tokio::task::spawn_blocking(move || execute(&script, ctx, timeout))
            .await
            .map_err(|e| ScriptError::Worker(e.to_string()))?
    }
}

fn execute(
    script: &str,
    ctx: ScriptContext,
    timeout: Duration,
) -> Result<ScriptOutcome, ScriptError> {
    let mut engine = Engine::new();
    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let deadline = Instant::now() + timeout;
    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    // Script-facing API: `assert` records its message on a false condition,
    // `log` records unconditionally, `print` is routed through the reserved
    // `print:` diagnostic prefix.
    let sink = messages.clone();
    engine.register_fn("assert", move |cond: bool, message: &str| {
        if !cond {
            sink.lock().unwrap().push(message.to_string());
        }
    });
    let sink = messages.clone();
    engine.register_fn("log", move |message: &str| {
        sink.lock().unwrap().push(message.to_string());
    });
    let sink = messages.clone();
    engine.on_print(move |text| {
        sink.lock().unwrap().push(format!("print: {}", text));
    });

    let mut scope = Scope::new();
    push_json(&mut scope, "response", ctx.response.unwrap_or(Value::Null));
    push_json(&mut scope, "params", ctx.params);
    push_json(&mut scope, "records", ctx.records);
    push_json(&mut scope, "global", ctx.global);
    let has_options = ctx.options.is_some();
    if let Some(options) = ctx.options {
        push_json(&mut scope, "options", options);
    }

    engine
        .run_with_scope(&mut scope, script)
        .map_err(|err| match *err {
            rhai::EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout(timeout),
            other => ScriptError::Eval(other.to_string()),
        })?;

    let options = if has_options {
        scope
            .get("options")
            .and_then(|d| rhai::serde::from_dynamic(d).ok())
    } else {
        None
    };

    let messages = messages.lock().unwrap().clone();
    Ok(ScriptOutcome { messages, options })
}

fn push_json(scope: &mut Scope<'_>, name: &'static str, value: Value) {
    let dynamic = rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT);
    scope.push_dynamic(name, dynamic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passing_script_records_no_messages() {
        let sandbox = Sandbox::default();
        let ctx = ScriptContext {
            response: Some(json!({"status": 200, "body": {"ok": true}})),
            ..Default::default()
        };
        let outcome = sandbox
            .run(r#"assert(response.status == 200, "unexpected status");"#, ctx)
            .await
            .unwrap();
        assert!(outcome.messages.is_empty());
    }

    #[tokio::test]
    async fn test_failed_assert_records_its_message() {
        let sandbox = Sandbox::default();
        let ctx = ScriptContext {
            response: Some(json!({"status": 500})),
            ..Default::default()
        };
        let outcome = sandbox
            .run(r#"assert(response.status == 200, "expected 200");"#, ctx)
            .await
            .unwrap();
        assert_eq!(outcome.messages, vec!["expected 200".to_string()]);
    }

    #[tokio::test]
    async fn test_print_routes_through_diagnostic_prefix() {
        let sandbox = Sandbox::default();
        let outcome = sandbox
            .run(r#"print("inspecting body"); log("real failure");"#, Default::default())
            .await
            .unwrap();
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[0], "print: inspecting body");
        assert_eq!(outcome.messages[1], "real failure");
    }

    #[tokio::test]
    async fn test_script_reads_params_and_records() {
        let sandbox = Sandbox::default();
        let ctx = ScriptContext {
            params: json!({"token": "abc"}),
            records: json!({"11": {"body": {"id": 42}}}),
            ..Default::default()
        };
        let outcome = sandbox
            .run(
                r#"
                assert(params.token == "abc", "token missing");
                assert(records["11"].body.id == 42, "record missing");
                "#,
                ctx,
            )
            .await
            .unwrap();
        assert!(outcome.messages.is_empty());
    }

    #[tokio::test]
    async fn test_syntax_error_surfaces_as_eval_error() {
        let sandbox = Sandbox::default();
        let err = sandbox
            .run("let x = ;", Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Eval(_)));
    }

    #[tokio::test]
    async fn test_runaway_loop_hits_the_deadline() {
        let sandbox = Sandbox::new(Duration::from_millis(50));
        let err = sandbox
            .run("loop { }", Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_pre_script_can_mutate_options() {
        let sandbox = Sandbox::default();
        let ctx = ScriptContext {
            options: Some(json!({"url": "http://a/", "headers": {}})),
            ..Default::default()
        };
        let outcome = sandbox
            .run(r#"options.headers["x-trace"] = "1";"#, ctx)
            .await
            .unwrap();
        let options = outcome.options.unwrap();
        assert_eq!(options["headers"]["x-trace"], "1");
    }
}

//! Per-case execution: build the request, call the transport, validate, classify.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::model::{
    EnvVariable, Environment, ExecutionRecord, HeaderEntry, RecordsMap, TestCase,
    ValidationMessage,
};
use crate::runner::resolver::ResolveContext;
use crate::sandbox::{Sandbox, ScriptContext};
use crate::transport::{
    realized_headers, ExecutionContext, RequestOptions, Transport,
};

/// Marker for script output that is diagnostic rather than a failure.
const PRINT_MARKER: &str = "print:";

/// Executes one test case end to end. Never returns an error; every failure
/// mode is folded into the execution record.
pub struct CaseRunner {
    transport: Arc<dyn Transport>,
    sandbox: Sandbox,
}

impl CaseRunner {
    pub fn new(transport: Arc<dyn Transport>, sandbox: Sandbox) -> Self {
        Self { transport, sandbox }
    }

    pub async fn run_case(
        &self,
        case: &TestCase,
        pre_script: &str,
        after_script: &str,
        env: &Environment,
        exec_ctx: &ExecutionContext,
        records: &RecordsMap,
    ) -> ExecutionRecord {
        let resolve = ResolveContext::new(&env.global, records);
        let (options, params) = build_request(case, env, &resolve);

        let mut record = ExecutionRecord {
            id: case.id,
            name: case.casename.clone(),
            path: case.path.clone(),
            code: ExecutionRecord::CODE_ERROR,
            status: None,
            status_text: String::new(),
            url: options.url.clone(),
            method: options.method.clone(),
            headers: realized_headers(&options.headers),
            data: options.body.clone(),
            res_header: HashMap::new(),
            res_body: Value::Null,
            run_time: 0,
            params: params.clone(),
            valid_res: Vec::new(),
        };

        let start = Instant::now();
        match self
            .transport
            .execute(options, pre_script, after_script, exec_ctx)
            .await
        {
            Ok(exchange) => {
                record.run_time = start.elapsed().as_millis() as u64;
                record.status = Some(exchange.res.status);
                record.status_text = exchange.res.status_text.clone();
                record.url = exchange.req.url.clone();
                record.method = exchange.req.method.clone();
                record.headers = exchange.req.headers.clone();
                record.data = exchange.req.body.clone();
                record.res_header = exchange.res.header.clone();
                record.res_body = exchange.res.body.clone();

                let messages = self
                    .run_validation(case, &exchange, &params, records, env)
                    .await;
                let (code, valid_res) = classify(messages);
                record.code = code;
                record.valid_res = valid_res;
            }
            Err(err) => {
                record.run_time = start.elapsed().as_millis() as u64;
                record.code = ExecutionRecord::CODE_ERROR;
                record.status_text = err.message.clone();
                if let Some(header) = err.header {
                    record.res_header = header;
                }
                record.res_body = err.body.unwrap_or(Value::String(err.message));
            }
        }

        record
    }

    async fn run_validation(
        &self,
        case: &TestCase,
        exchange: &crate::transport::Exchange,
        params: &Value,
        records: &RecordsMap,
        env: &Environment,
    ) -> Vec<String> {
        if case.test_script.is_empty() {
            return Vec::new();
        }

        let ctx = ScriptContext {
            response: Some(json!({
                "status": exchange.res.status,
                "statusText": exchange.res.status_text,
                "header": exchange.res.header,
                "body": exchange.res.body,
            })),
            params: params.clone(),
            records: records_to_value(records),
            global: globals_to_value(&env.global),
            options: None,
        };

        match self.sandbox.run(&case.test_script, ctx).await {
            Ok(outcome) => outcome.messages,
            Err(err) => vec![format!("script error: {}", err)],
        }
    }
}

/// Classify validation output. `print:`-prefixed messages are diagnostics and
/// never count toward failure; zero remaining messages passes with a single
/// synthetic message.
fn classify(messages: Vec<String>) -> (i64, Vec<ValidationMessage>) {
    let mut failures = Vec::new();
    for message in messages {
        match message.strip_prefix(PRINT_MARKER) {
            Some(text) => debug!(target: "script_output", "{}", text.trim_start()),
            None => failures.push(ValidationMessage::new(message)),
        }
    }

    if failures.is_empty() {
        (
            ExecutionRecord::CODE_PASSED,
            vec![ValidationMessage::new("validation passed")],
        )
    } else {
        (ExecutionRecord::CODE_FAILED, failures)
    }
}

/// Build the outgoing request from the case definition, resolving every
/// templated value. Returns the options together with the resolved parameter
/// map recorded for dependent cases.
fn build_request(
    case: &TestCase,
    env: &Environment,
    resolve: &ResolveContext,
) -> (RequestOptions, Value) {
    let url = join_url(&env.domain, &resolve.interpolate(&case.path));

    let mut query = Vec::new();
    let mut params = Map::new();
    for entry in &case.req_query {
        if !entry.abled || entry.name.is_empty() {
            continue;
        }
        let value = resolve.interpolate(&entry.value);
        params.insert(entry.name.clone(), Value::String(value.clone()));
        query.push((entry.name.clone(), value));
    }

    let headers: Vec<HeaderEntry> = case
        .req_headers
        .iter()
        .map(|h| HeaderEntry {
            name: h.name.clone(),
            value: resolve.interpolate(&h.value),
            abled: h.abled,
        })
        .collect();

    let body = resolve.resolve_value(&case.req_body);
    if let Value::Object(fields) = &body {
        for (name, value) in fields {
            params.insert(name.clone(), value.clone());
        }
    }

    (
        RequestOptions {
            url,
            method: case.method.clone(),
            headers,
            query,
            body,
        },
        Value::Object(params),
    )
}

fn join_url(domain: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        domain.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn records_to_value(records: &RecordsMap) -> Value {
    serde_json::to_value(records).unwrap_or(Value::Null)
}

fn globals_to_value(global: &[EnvVariable]) -> Value {
    let map: Map<String, Value> = global
        .iter()
        .filter(|v| !v.name.is_empty())
        .map(|v| (v.name.clone(), Value::String(v.value.clone())))
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> Environment {
        Environment {
            name: "staging".into(),
            domain: "http://api.internal/".into(),
            header: vec![],
            global: vec![EnvVariable {
                name: "version".into(),
                value: "v2".into(),
            }],
        }
    }

    fn case() -> TestCase {
        TestCase {
            id: 5,
            col_id: 1,
            casename: "get user".into(),
            path: "/{{global.version}}/users".into(),
            method: "GET".into(),
            req_headers: vec![],
            req_query: vec![crate::model::QueryEntry {
                name: "name".into(),
                value: "{{global.version}}-alice".into(),
                abled: true,
            }],
            req_body: Value::Null,
            pre_script: String::new(),
            after_script: String::new(),
            test_script: String::new(),
            test_script_type: "rhai".into(),
            case_env: String::new(),
            sort: 0,
        }
    }

    #[test]
    fn test_build_request_resolves_path_and_query() {
        let resolve = ResolveContext::new(&env().global, &HashMap::new());
        let (options, params) = build_request(&case(), &env(), &resolve);
        assert_eq!(options.url, "http://api.internal/v2/users");
        assert_eq!(options.query, vec![("name".to_string(), "v2-alice".to_string())]);
        assert_eq!(params["name"], "v2-alice");
    }

    #[test]
    fn test_build_request_merges_body_fields_into_params() {
        let mut case = case();
        case.method = "POST".into();
        case.req_body = serde_json::json!({"user": "bob", "age": 30});
        let resolve = ResolveContext::new(&env().global, &HashMap::new());
        let (_, params) = build_request(&case, &env(), &resolve);
        assert_eq!(params["user"], "bob");
        assert_eq!(params["age"], 30);
        assert_eq!(params["name"], "v2-alice");
    }

    #[test]
    fn test_absolute_path_bypasses_domain_join() {
        let mut case = case();
        case.path = "https://other.example/health".into();
        let resolve = ResolveContext::new(&[], &HashMap::new());
        let (options, _) = build_request(&case, &env(), &resolve);
        assert_eq!(options.url, "https://other.example/health");
    }

    #[test]
    fn test_classify_zero_messages_passes() {
        let (code, valid_res) = classify(vec![]);
        assert_eq!(code, ExecutionRecord::CODE_PASSED);
        assert_eq!(valid_res, vec![ValidationMessage::new("validation passed")]);
    }

    #[test]
    fn test_classify_messages_fail_verbatim() {
        let (code, valid_res) = classify(vec!["expected 200".into(), "body empty".into()]);
        assert_eq!(code, ExecutionRecord::CODE_FAILED);
        assert_eq!(valid_res.len(), 2);
        assert_eq!(valid_res[0].message, "expected 200");
    }

    #[test]
    fn test_classify_print_messages_are_diagnostics() {
        let (code, valid_res) = classify(vec!["print: inspecting body".into()]);
        assert_eq!(code, ExecutionRecord::CODE_PASSED);
        assert_eq!(valid_res, vec![ValidationMessage::new("validation passed")]);

        let (code, valid_res) =
            classify(vec!["print: one".into(), "real failure".into()]);
        assert_eq!(code, ExecutionRecord::CODE_FAILED);
        assert_eq!(valid_res.len(), 1);
        assert_eq!(valid_res[0].message, "real failure");
    }
}

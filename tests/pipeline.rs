//! End-to-end pipeline tests: orchestrator + sandbox + storage against a
//! scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use apipatrol::model::{
    EnvVariable, Environment, HeaderEntry, Project, TestCase, Timer, TimerStatus,
};
use apipatrol::notify::{Notice, Notifier};
use apipatrol::runner::RunOrchestrator;
use apipatrol::sandbox::Sandbox;
use apipatrol::storage::{open_pool, Persistence, SqliteStore};
use apipatrol::transport::{
    Exchange, ExecutionContext, RealizedRequest, RealizedResponse, RequestOptions, Transport,
    TransportError,
};

/// Replays canned outcomes keyed by URL suffix and records every request sent.
struct ScriptedTransport {
    responses: Vec<(String, Result<(u16, Value), String>)>,
    seen: Mutex<Vec<RequestOptions>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<(&str, Result<(u16, Value), String>)>) -> Self {
        Self {
            responses: responses
                .into_iter()
                .map(|(suffix, outcome)| (suffix.to_string(), outcome))
                .collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<RequestOptions> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        options: RequestOptions,
        _pre_script: &str,
        _after_script: &str,
        _ctx: &ExecutionContext,
    ) -> Result<Exchange, TransportError> {
        self.seen.lock().unwrap().push(options.clone());
        for (suffix, outcome) in &self.responses {
            if options.url.ends_with(suffix.as_str()) {
                return match outcome {
                    Ok((status, body)) => Ok(Exchange {
                        req: RealizedRequest {
                            url: options.url.clone(),
                            method: options.method.clone(),
                            headers: Default::default(),
                            body: options.body.clone(),
                        },
                        res: RealizedResponse {
                            status: *status,
                            status_text: "OK".into(),
                            header: Default::default(),
                            body: body.clone(),
                        },
                    }),
                    Err(message) => Err(TransportError::new(message.clone())),
                };
            }
        }
        Err(TransportError::new(format!(
            "no scripted response for {}",
            options.url
        )))
    }
}

struct CountingNotifier {
    calls: AtomicUsize,
    last_title: Mutex<Option<String>>,
}

impl CountingNotifier {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            last_title: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify(&self, _project_id: i64, notice: &Notice) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_title.lock().unwrap() = Some(notice.title.clone());
        Ok(())
    }
}

fn case(id: i64, path: &str, sort: i64) -> TestCase {
    TestCase {
        id,
        col_id: 1,
        casename: format!("case-{}", id),
        path: path.into(),
        method: "POST".into(),
        req_headers: vec![],
        req_query: vec![],
        req_body: Value::Null,
        pre_script: String::new(),
        after_script: String::new(),
        test_script: String::new(),
        test_script_type: "rhai".into(),
        case_env: String::new(),
        sort,
    }
}

fn timer(notice: bool) -> Timer {
    Timer {
        id: 9,
        name: "nightly".into(),
        project_id: 1,
        col_id: 1,
        env: "staging".into(),
        cron_expression: "0 0 2 * * *".into(),
        status: TimerStatus::Open,
        notice,
        uid: 3,
        add_time: 0,
        up_time: 0,
    }
}

/// Seed a fresh on-disk store with one project, one environment, and the
/// given cases.
fn seeded_store(dir: &tempfile::TempDir, cases: &[TestCase]) -> SqliteStore {
    let db_path = dir.path().join("pipeline.db");
    let pool = open_pool(db_path.to_str().unwrap()).unwrap();
    let store = SqliteStore::new(pool);

    store
        .save_project(&Project {
            id: 1,
            name: "demo".into(),
            pre_script: String::new(),
            after_script: String::new(),
        })
        .unwrap();
    store
        .save_environment(
            1,
            &Environment {
                name: "staging".into(),
                domain: "http://api.staging.internal".into(),
                header: vec![HeaderEntry {
                    name: "X-Env".into(),
                    value: "staging".into(),
                    abled: true,
                }],
                global: vec![EnvVariable {
                    name: "host".into(),
                    value: "api.staging.internal".into(),
                }],
            },
        )
        .unwrap();
    for case in cases {
        store.save_case(case).unwrap();
    }
    store
}

fn orchestrator(
    store: &SqliteStore,
    transport: Arc<ScriptedTransport>,
    notifier: Arc<CountingNotifier>,
) -> RunOrchestrator {
    RunOrchestrator::new(
        Arc::new(store.clone()),
        transport,
        notifier,
        Sandbox::default(),
    )
}

#[tokio::test]
async fn test_token_flows_from_earlier_case_to_later_case() {
    let dir = tempfile::tempdir().unwrap();
    let mut login = case(11, "/login", 0);
    login.req_body = json!({"user": "alice"});
    let mut profile = case(12, "/profile", 1);
    profile.req_body = json!({"token": "{{11.body.token}}"});
    let store = seeded_store(&dir, &[login, profile]);

    let transport = Arc::new(ScriptedTransport::new(vec![
        ("/login", Ok((200, json!({"token": "abc"})))),
        ("/profile", Ok((200, json!({"ok": true})))),
    ]));
    let notifier = Arc::new(CountingNotifier::new());
    let orchestrator = orchestrator(&store, transport.clone(), notifier);

    let report = orchestrator.run_task(&timer(false)).await.unwrap().unwrap();

    assert_eq!(report.status.to_string(), "ok");
    assert_eq!(report.test_list.len(), 2);

    let seen = transport.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].body["token"], "abc", "resolved from case 11's record");

    // Environment default header was merged into both requests.
    assert!(seen[0].headers.iter().any(|h| h.name == "X-Env"));

    // The report was persisted with its test list intact.
    let stored = store.list_reports(1, 20, 1).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].report.test_list.len(), 2);
    assert_eq!(stored[0].report.timer_id, 9);
}

#[tokio::test]
async fn test_transport_error_does_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, &[case(11, "/login", 0), case(12, "/profile", 1)]);

    let transport = Arc::new(ScriptedTransport::new(vec![
        ("/login", Err("ECONNRESET".to_string())),
        ("/profile", Ok((200, json!({"ok": true})))),
    ]));
    let notifier = Arc::new(CountingNotifier::new());
    let orchestrator = orchestrator(&store, transport.clone(), notifier);

    let report = orchestrator.run_task(&timer(false)).await.unwrap().unwrap();

    assert_eq!(report.status.to_string(), "failed");
    assert_eq!(report.test_list.len(), 2, "both cases appear in the report");

    let first = &report.test_list[0];
    assert_eq!(first.code, 400);
    assert_eq!(first.status_text, "ECONNRESET");
    assert!(first.status.is_none());

    let second = &report.test_list[1];
    assert_eq!(second.code, 0);
    assert_eq!(transport.seen().len(), 2, "case 12 still executed");
}

#[tokio::test]
async fn test_missing_collection_aborts_without_a_report() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, &[]);

    let transport = Arc::new(ScriptedTransport::new(vec![]));
    let notifier = Arc::new(CountingNotifier::new());
    let orchestrator = orchestrator(&store, transport.clone(), notifier.clone());

    let outcome = orchestrator.run_task(&timer(true)).await.unwrap();
    assert!(outcome.is_none());
    assert!(transport.seen().is_empty());
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    assert!(store.list_reports(1, 20, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_validation_failures_mark_the_run_failed() {
    let dir = tempfile::tempdir().unwrap();
    let mut checked = case(11, "/login", 0);
    checked.test_script = r#"
        print("inspecting response");
        assert(response.status == 200, "expected 200");
        assert(response.body.ok == true, "body not ok");
    "#
    .into();
    let store = seeded_store(&dir, &[checked]);

    let transport = Arc::new(ScriptedTransport::new(vec![(
        "/login",
        Ok((200, json!({"ok": false}))),
    )]));
    let notifier = Arc::new(CountingNotifier::new());
    let orchestrator = orchestrator(&store, transport, notifier);

    let report = orchestrator.run_task(&timer(false)).await.unwrap().unwrap();

    assert_eq!(report.status.to_string(), "failed");
    let record = &report.test_list[0];
    assert_eq!(record.code, 1);
    // The print diagnostic is excluded from the validation messages.
    assert_eq!(record.valid_res.len(), 1);
    assert_eq!(record.valid_res[0].message, "body not ok");
}

#[tokio::test]
async fn test_notifier_fires_only_on_failure_with_notice_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir, &[case(11, "/login", 0)]);

    // Failure with notice set: one notification.
    let transport = Arc::new(ScriptedTransport::new(vec![(
        "/login",
        Err("connection refused".to_string()),
    )]));
    let notifier = Arc::new(CountingNotifier::new());
    let orch = orchestrator(&store, transport, notifier.clone());
    orch.run_task(&timer(true)).await.unwrap().unwrap();
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    let title = notifier.last_title.lock().unwrap().clone().unwrap();
    assert!(title.contains("nightly"));

    // Success with notice set: silence.
    let transport = Arc::new(ScriptedTransport::new(vec![(
        "/login",
        Ok((200, json!({"ok": true}))),
    )]));
    let notifier = Arc::new(CountingNotifier::new());
    let orch = orchestrator(&store, transport, notifier.clone());
    orch.run_task(&timer(true)).await.unwrap().unwrap();
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_forward_reference_resolves_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = case(11, "/login", 0);
    // Case 12 has not executed when case 11 runs.
    first.req_body = json!({"future": "{{12.body.token}}"});
    let store = seeded_store(&dir, &[first, case(12, "/profile", 1)]);

    let transport = Arc::new(ScriptedTransport::new(vec![
        ("/login", Ok((200, json!({"token": "abc"})))),
        ("/profile", Ok((200, json!({"ok": true})))),
    ]));
    let notifier = Arc::new(CountingNotifier::new());
    let orchestrator = orchestrator(&store, transport.clone(), notifier);

    orchestrator.run_task(&timer(false)).await.unwrap().unwrap();

    let seen = transport.seen();
    assert_eq!(seen[0].body["future"], Value::Null);
}

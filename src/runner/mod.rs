//! Run orchestration -- one timer firing executed end to end.

pub mod case;
pub mod headers;
pub mod resolver;

pub use case::CaseRunner;
pub use headers::merge_env_headers;
pub use resolver::ResolveContext;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::{
    CaseRecord, Environment, ExecutionRecord, RecordsMap, Report, RunStatus, Timer, unix_time,
};
use crate::notify::{Notice, Notifier};
use crate::sandbox::Sandbox;
use crate::storage::Persistence;
use crate::transport::{ExecutionContext, Transport};

/// Drives one run: loads configuration, executes cases in collection order,
/// aggregates the report, persists it, and notifies on failure.
pub struct RunOrchestrator {
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    runner: CaseRunner,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn Persistence>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            store,
            notifier,
            runner: CaseRunner::new(transport, sandbox),
        }
    }

    /// Execute one run for `timer`. The single entry point for cron firings,
    /// manual API runs, and the CLI. `Ok(None)` means the run aborted on a
    /// configuration-integrity failure before any case executed.
    pub async fn run_task(&self, timer: &Timer) -> Result<Option<Report>> {
        let run_id = Uuid::new_v4();

        let cases = match self.store.load_collection_cases(timer.col_id).await {
            Ok(cases) if !cases.is_empty() => cases,
            Ok(_) => {
                warn!(
                    run = %run_id,
                    timer = timer.id,
                    col = timer.col_id,
                    "collection missing or empty, run aborted"
                );
                return Ok(None);
            }
            Err(e) => {
                warn!(run = %run_id, timer = timer.id, error = %e, "failed to load collection, run aborted");
                return Ok(None);
            }
        };

        let project = match self.store.load_project(timer.project_id).await {
            Ok(Some(project)) => project,
            Ok(None) => {
                warn!(run = %run_id, timer = timer.id, project = timer.project_id, "project missing, run aborted");
                return Ok(None);
            }
            Err(e) => {
                warn!(run = %run_id, timer = timer.id, error = %e, "failed to load project, run aborted");
                return Ok(None);
            }
        };

        let environments = match self.store.load_environments(timer.project_id).await {
            Ok(environments) if !environments.is_empty() => environments,
            Ok(_) => {
                warn!(run = %run_id, timer = timer.id, "project has no environments, run aborted");
                return Ok(None);
            }
            Err(e) => {
                warn!(run = %run_id, timer = timer.id, error = %e, "failed to load environments, run aborted");
                return Ok(None);
            }
        };

        let env = select_environment(&environments, &timer.env);
        info!(
            run = %run_id,
            timer = timer.id,
            name = %timer.name,
            env = %env.name,
            cases = cases.len(),
            "run started"
        );

        // Cases execute strictly in collection order: later cases may
        // reference earlier cases' records, never the reverse.
        let mut records: RecordsMap = HashMap::new();
        let mut test_list: Vec<ExecutionRecord> = Vec::with_capacity(cases.len());

        for item in &cases {
            let mut case = item.clone();
            case.req_headers = merge_env_headers(case.req_headers, &env.header);

            let pre_script = if case.pre_script.is_empty() {
                project.pre_script.as_str()
            } else {
                case.pre_script.as_str()
            };
            let after_script = if case.after_script.is_empty() {
                project.after_script.as_str()
            } else {
                case.after_script.as_str()
            };

            let exec_ctx = ExecutionContext {
                run_id,
                uid: timer.uid,
                case_id: case.id,
            };
            let record = self
                .runner
                .run_case(&case, pre_script, after_script, env, &exec_ctx, &records)
                .await;

            debug!(
                run = %run_id,
                case = case.id,
                name = %case.casename,
                code = record.code,
                run_time = record.run_time,
                "case finished"
            );

            // Failed cases still contribute their attempted params/body so
            // dependent cases can reference them.
            records.insert(
                case.id,
                CaseRecord {
                    params: record.params.clone(),
                    body: record.res_body.clone(),
                },
            );
            test_list.push(record);
        }

        let failed = test_list
            .iter()
            .filter(|r| r.code != ExecutionRecord::CODE_PASSED)
            .count();
        let report = Report {
            uid: timer.uid,
            project_id: timer.project_id,
            col_id: timer.col_id,
            timer_id: timer.id,
            env: env.name.clone(),
            test_list,
            add_time: unix_time(),
            status: if failed == 0 {
                RunStatus::Ok
            } else {
                RunStatus::Failed
            },
        };

        if let Err(e) = self.store.save_report(&report).await {
            error!(run = %run_id, timer = timer.id, error = %e, "failed to persist report");
        }

        if timer.notice && failed > 0 {
            let notice = Notice::for_failed_run(&timer.name, &report);
            if let Err(e) = self.notifier.notify(timer.project_id, &notice).await {
                error!(run = %run_id, timer = timer.id, error = %e, "notification failed");
            }
        }

        info!(
            run = %run_id,
            timer = timer.id,
            status = %report.status,
            total = report.test_list.len(),
            failed,
            "run finished"
        );
        Ok(Some(report))
    }
}

/// The environment whose name matches, else the first defined one.
fn select_environment<'a>(environments: &'a [Environment], name: &str) -> &'a Environment {
    environments
        .iter()
        .find(|e| e.name == name)
        .unwrap_or(&environments[0])
}

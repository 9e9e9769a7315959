//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use anyhow::{Context, Result};
use async_trait::async_trait;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    EnvVariable, Environment, HeaderEntry, Project, QueryEntry, Report, RunStatus, TestCase,
    Timer, TimerStatus,
};

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A persisted report together with its storage id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReport {
    pub id: i64,
    #[serde(flatten)]
    pub report: Report,
}

/// Persistence collaborator consumed by the scheduler and orchestrator.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_open_timers(&self) -> Result<Vec<Timer>>;
    async fn load_timer(&self, id: i64) -> Result<Option<Timer>>;
    async fn list_timers(&self, project_id: i64) -> Result<Vec<Timer>>;
    async fn save_timer(&self, timer: &Timer) -> Result<i64>;
    async fn update_timer(&self, timer: &Timer) -> Result<()>;
    async fn delete_timer(&self, id: i64) -> Result<()>;

    async fn load_collection_cases(&self, col_id: i64) -> Result<Vec<TestCase>>;
    async fn load_project(&self, project_id: i64) -> Result<Option<Project>>;
    async fn load_environments(&self, project_id: i64) -> Result<Vec<Environment>>;

    async fn save_report(&self, report: &Report) -> Result<i64>;
    async fn list_reports(
        &self,
        project_id: i64,
        limit: u32,
        page: u32,
    ) -> Result<Vec<StoredReport>>;
    async fn load_report(&self, id: i64) -> Result<Option<StoredReport>>;
}

/// Production persistence on an r2d2 SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or replace a project definition; used by fixtures and bootstrap tooling.
    pub fn save_project(&self, project: &Project) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO projects (id, name, pre_script, after_script) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = ?2, pre_script = ?3, after_script = ?4",
            params![
                project.id,
                project.name,
                project.pre_script,
                project.after_script
            ],
        )
        .context("failed to insert project")?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert an environment for a project; used by fixtures and bootstrap tooling.
    pub fn save_environment(&self, project_id: i64, env: &Environment) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO environments (project_id, name, domain, header_json, global_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project_id,
                env.name,
                env.domain,
                serde_json::to_string(&env.header)?,
                serde_json::to_string(&env.global)?,
            ],
        )
        .context("failed to insert environment")?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a test case; used by fixtures and bootstrap tooling.
    pub fn save_case(&self, case: &TestCase) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cases (id, col_id, casename, path, method, req_headers_json,
                                req_query_json, req_body_json, pre_script, after_script,
                                test_script, test_script_type, case_env, sort)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                case.id,
                case.col_id,
                case.casename,
                case.path,
                case.method,
                serde_json::to_string(&case.req_headers)?,
                serde_json::to_string(&case.req_query)?,
                serde_json::to_string(&case.req_body)?,
                case.pre_script,
                case.after_script,
                case.test_script,
                case.test_script_type,
                case.case_env,
                case.sort,
            ],
        )
        .context("failed to insert test case")?;
        Ok(conn.last_insert_rowid())
    }
}

fn timer_from_row(row: &Row<'_>) -> rusqlite::Result<Timer> {
    let status: String = row.get("status")?;
    Ok(Timer {
        id: row.get("id")?,
        name: row.get("name")?,
        project_id: row.get("project_id")?,
        col_id: row.get("col_id")?,
        env: row.get("env")?,
        cron_expression: row.get("cron_expression")?,
        status: status.parse().unwrap_or(TimerStatus::Open),
        notice: row.get::<_, i64>("notice")? != 0,
        uid: row.get("uid")?,
        add_time: row.get("add_time")?,
        up_time: row.get("up_time")?,
    })
}

fn case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    let headers: String = row.get("req_headers_json")?;
    let query: String = row.get("req_query_json")?;
    let body: String = row.get("req_body_json")?;
    Ok(TestCase {
        id: row.get("id")?,
        col_id: row.get("col_id")?,
        casename: row.get("casename")?,
        path: row.get("path")?,
        method: row.get("method")?,
        req_headers: serde_json::from_str::<Vec<HeaderEntry>>(&headers).unwrap_or_default(),
        req_query: serde_json::from_str::<Vec<QueryEntry>>(&query).unwrap_or_default(),
        req_body: serde_json::from_str::<Value>(&body).unwrap_or(Value::Null),
        pre_script: row.get("pre_script")?,
        after_script: row.get("after_script")?,
        test_script: row.get("test_script")?,
        test_script_type: row.get("test_script_type")?,
        case_env: row.get("case_env")?,
        sort: row.get("sort")?,
    })
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<Environment> {
    let header: String = row.get("header_json")?;
    let global: String = row.get("global_json")?;
    Ok(Environment {
        name: row.get("name")?,
        domain: row.get("domain")?,
        header: serde_json::from_str::<Vec<HeaderEntry>>(&header).unwrap_or_default(),
        global: serde_json::from_str::<Vec<EnvVariable>>(&global).unwrap_or_default(),
    })
}

fn stored_report_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReport> {
    let test_list: String = row.get("test_list_json")?;
    let status: String = row.get("status")?;
    Ok(StoredReport {
        id: row.get("id")?,
        report: Report {
            uid: row.get("uid")?,
            project_id: row.get("project_id")?,
            col_id: row.get("col_id")?,
            timer_id: row.get("timer_id")?,
            env: row.get("env")?,
            test_list: serde_json::from_str(&test_list).unwrap_or_default(),
            add_time: row.get("add_time")?,
            status: if status == "failed" {
                RunStatus::Failed
            } else {
                RunStatus::Ok
            },
        },
    })
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn load_open_timers(&self) -> Result<Vec<Timer>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM timers WHERE status = 'open'")?;
        let rows = stmt.query_map([], timer_from_row)?;
        let mut timers = Vec::new();
        for timer in rows {
            timers.push(timer?);
        }
        Ok(timers)
    }

    async fn load_timer(&self, id: i64) -> Result<Option<Timer>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM timers WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], timer_from_row)?;
        rows.next().transpose().context("failed to load timer")
    }

    async fn list_timers(&self, project_id: i64) -> Result<Vec<Timer>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT * FROM timers WHERE project_id = ?1 ORDER BY id DESC")?;
        let rows = stmt.query_map(params![project_id], timer_from_row)?;
        let mut timers = Vec::new();
        for timer in rows {
            timers.push(timer?);
        }
        Ok(timers)
    }

    async fn save_timer(&self, timer: &Timer) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO timers (name, project_id, col_id, env, cron_expression, status,
                                 notice, uid, add_time, up_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                timer.name,
                timer.project_id,
                timer.col_id,
                timer.env,
                timer.cron_expression,
                timer.status.to_string(),
                timer.notice as i64,
                timer.uid,
                timer.add_time,
                timer.up_time,
            ],
        )
        .context("failed to insert timer")?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_timer(&self, timer: &Timer) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE timers SET name = ?2, project_id = ?3, col_id = ?4, env = ?5,
                               cron_expression = ?6, status = ?7, notice = ?8, up_time = ?9
             WHERE id = ?1",
            params![
                timer.id,
                timer.name,
                timer.project_id,
                timer.col_id,
                timer.env,
                timer.cron_expression,
                timer.status.to_string(),
                timer.notice as i64,
                timer.up_time,
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("timer {} not found", timer.id);
        }
        Ok(())
    }

    async fn delete_timer(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM timers WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn load_collection_cases(&self, col_id: i64) -> Result<Vec<TestCase>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM cases WHERE col_id = ?1 ORDER BY sort, id")?;
        let rows = stmt.query_map(params![col_id], case_from_row)?;
        let mut cases = Vec::new();
        for case in rows {
            cases.push(case?);
        }
        Ok(cases)
    }

    async fn load_project(&self, project_id: i64) -> Result<Option<Project>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT id, name, pre_script, after_script FROM projects WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![project_id], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                pre_script: row.get(2)?,
                after_script: row.get(3)?,
            })
        })?;
        rows.next().transpose().context("failed to load project")
    }

    async fn load_environments(&self, project_id: i64) -> Result<Vec<Environment>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT name, domain, header_json, global_json FROM environments
             WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_id], environment_from_row)?;
        let mut environments = Vec::new();
        for env in rows {
            environments.push(env?);
        }
        Ok(environments)
    }

    async fn save_report(&self, report: &Report) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO reports (uid, project_id, col_id, timer_id, env, test_list_json,
                                  add_time, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.uid,
                report.project_id,
                report.col_id,
                report.timer_id,
                report.env,
                serde_json::to_string(&report.test_list)?,
                report.add_time,
                report.status.to_string(),
            ],
        )
        .context("failed to insert report")?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_reports(
        &self,
        project_id: i64,
        limit: u32,
        page: u32,
    ) -> Result<Vec<StoredReport>> {
        let conn = self.pool.get()?;
        let offset = page.saturating_sub(1) * limit;
        let mut stmt = conn.prepare(
            "SELECT * FROM reports WHERE project_id = ?1
             ORDER BY add_time DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![project_id, limit, offset], stored_report_from_row)?;
        let mut reports = Vec::new();
        for report in rows {
            reports.push(report?);
        }
        Ok(reports)
    }

    async fn load_report(&self, id: i64) -> Result<Option<StoredReport>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM reports WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], stored_report_from_row)?;
        rows.next().transpose().context("failed to load report")
    }
}

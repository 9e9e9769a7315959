//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            pre_script TEXT NOT NULL DEFAULT '',
            after_script TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS environments (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            domain TEXT NOT NULL,
            header_json TEXT NOT NULL DEFAULT '[]',
            global_json TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS cases (
            id INTEGER PRIMARY KEY,
            col_id INTEGER NOT NULL,
            casename TEXT NOT NULL,
            path TEXT NOT NULL,
            method TEXT NOT NULL,
            req_headers_json TEXT NOT NULL DEFAULT '[]',
            req_query_json TEXT NOT NULL DEFAULT '[]',
            req_body_json TEXT NOT NULL DEFAULT 'null',
            pre_script TEXT NOT NULL DEFAULT '',
            after_script TEXT NOT NULL DEFAULT '',
            test_script TEXT NOT NULL DEFAULT '',
            test_script_type TEXT NOT NULL DEFAULT 'rhai',
            case_env TEXT NOT NULL DEFAULT '',
            sort INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS timers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            project_id INTEGER NOT NULL,
            col_id INTEGER NOT NULL,
            env TEXT NOT NULL DEFAULT '',
            cron_expression TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            notice INTEGER NOT NULL DEFAULT 0,
            uid INTEGER NOT NULL DEFAULT 0,
            add_time INTEGER NOT NULL DEFAULT 0,
            up_time INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS reports (
            id INTEGER PRIMARY KEY,
            uid INTEGER NOT NULL DEFAULT 0,
            project_id INTEGER NOT NULL,
            col_id INTEGER NOT NULL,
            timer_id INTEGER NOT NULL DEFAULT 0,
            env TEXT NOT NULL DEFAULT '',
            test_list_json TEXT NOT NULL DEFAULT '[]',
            add_time INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_environments_project ON environments(project_id);
        CREATE INDEX IF NOT EXISTS idx_cases_col ON cases(col_id);
        CREATE INDEX IF NOT EXISTS idx_timers_project ON timers(project_id);
        CREATE INDEX IF NOT EXISTS idx_timers_status ON timers(status);
        CREATE INDEX IF NOT EXISTS idx_reports_project ON reports(project_id, add_time);",
    )?;

    Ok(())
}

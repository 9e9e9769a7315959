//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::model::{unix_time, Timer, TimerStatus};
use crate::scheduler::parse_cron;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/timers", get(list_timers).post(create_timer))
        .route(
            "/timers/{id}",
            get(get_timer).put(update_timer).delete(delete_timer),
        )
        .route("/timers/{id}/run", post(run_timer))
        .route("/reports", get(list_reports))
        .route("/reports/{id}", get(get_report))
}

fn ok(data: Value) -> Response {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "data": null, "meta": { "message": message.into() } })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Deserialize)]
struct ProjectQuery {
    project_id: i64,
}

async fn list_timers(State(state): State<AppState>, Query(q): Query<ProjectQuery>) -> Response {
    match state.store.list_timers(q.project_id).await {
        Ok(timers) => ok(json!(timers)),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn create_timer(State(state): State<AppState>, Json(mut timer): Json<Timer>) -> Response {
    if let Err(e) = parse_cron(&timer.cron_expression) {
        return fail(StatusCode::BAD_REQUEST, e.to_string());
    }

    timer.add_time = unix_time();
    timer.up_time = timer.add_time;
    let id = match state.store.save_timer(&timer).await {
        Ok(id) => id,
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    timer.id = id;

    // Closed timers are persisted without a live job.
    if timer.status == TimerStatus::Open {
        if let Err(e) = state.scheduler.add_job(&timer).await {
            return fail(StatusCode::BAD_REQUEST, e.to_string());
        }
    }
    ok(json!(timer))
}

async fn get_timer(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.load_timer(id).await {
        Ok(Some(timer)) => ok(json!(timer)),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("timer {} not found", id)),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn update_timer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(mut timer): Json<Timer>,
) -> Response {
    if let Err(e) = parse_cron(&timer.cron_expression) {
        return fail(StatusCode::BAD_REQUEST, e.to_string());
    }

    timer.id = id;
    timer.up_time = unix_time();
    if let Err(e) = state.store.update_timer(&timer).await {
        return fail(StatusCode::NOT_FOUND, e.to_string());
    }
    if let Err(e) = state.scheduler.update_job(&timer).await {
        return fail(StatusCode::BAD_REQUEST, e.to_string());
    }
    ok(json!(timer))
}

async fn delete_timer(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.store.delete_timer(id).await {
        return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    state.scheduler.remove_job(id).await;
    ok(Value::Null)
}

/// Manual on-demand run; shares the scheduled path's single entry point.
async fn run_timer(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let timer = match state.store.load_timer(id).await {
        Ok(Some(timer)) => timer,
        Ok(None) => return fail(StatusCode::NOT_FOUND, format!("timer {} not found", id)),
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state.orchestrator.run_task(&timer).await {
        Ok(Some(report)) => ok(json!(report)),
        Ok(None) => fail(
            StatusCode::UNPROCESSABLE_ENTITY,
            "run aborted: collection, project, or environments missing",
        ),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn default_limit() -> u32 {
    20
}

fn default_page() -> u32 {
    1
}

#[derive(Deserialize)]
struct ReportQuery {
    project_id: i64,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default = "default_page")]
    page: u32,
}

async fn list_reports(State(state): State<AppState>, Query(q): Query<ReportQuery>) -> Response {
    match state.store.list_reports(q.project_id, q.limit, q.page).await {
        Ok(reports) => {
            let total = reports.len();
            Json(json!({ "data": reports, "meta": { "total": total, "page": q.page } }))
                .into_response()
        }
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_report(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.load_report(id).await {
        Ok(Some(report)) => ok(json!(report)),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("report {} not found", id)),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

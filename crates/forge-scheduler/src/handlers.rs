use std::convert::Infallible;
use std::str::FromStr;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use uuid::Uuid;

use forge_common::auth::{require_role, AuthContext, Role};
use forge_common::{
    DatasetRegister, EvalReport, EvalStatus, Heartbeat, ModelPromote, ModelStage, NodeHealth,
    NodeSpec, Page, ParseEnumError, Recipe, RunFailure, RunLaunch, RunMetricPoint, RunStatus,
    StageChange,
};
use forge_scheduler::{DatasetFilter, SchedulerError};

use crate::state::AppState;

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
            request_id: format!("req_{}", Uuid::new_v4()),
        },
    };
    (status, Json(body)).into_response()
}

fn api_error(err: SchedulerError) -> Response {
    let status = match &err {
        SchedulerError::NodeNotFound(_)
        | SchedulerError::RunNotFound(_)
        | SchedulerError::DatasetNotFound(_)
        | SchedulerError::ModelNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::DuplicateNode(_)
        | SchedulerError::NodeBusy { .. }
        | SchedulerError::Conflict(_)
        | SchedulerError::InvalidTransition { .. }
        | SchedulerError::InvalidStageTransition { .. }
        | SchedulerError::RetriesExhausted { .. }
        | SchedulerError::InsufficientCapacity { .. } => StatusCode::CONFLICT,
        SchedulerError::InvalidRequest(_)
        | SchedulerError::EvalGate { .. }
        | SchedulerError::Unschedulable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    tracing::debug!(code = err.code(), error = %err, "request refused");
    error_response(status, err.code(), &err.to_string())
}

fn bad_filter(err: ParseEnumError) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "invalid_request",
        &err.to_string(),
    )
}

fn parse_filter<T>(raw: Option<&str>) -> Result<Option<T>, Response>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(bad_filter)
}

// ── Query parameters ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunListQuery {
    pub status: Option<String>,
    pub recipe: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatasetListQuery {
    pub name: Option<String>,
    pub version: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelListQuery {
    pub stage: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EvalListQuery {
    pub status: Option<String>,
    pub model_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    pub num_gpus: u32,
    #[serde(alias = "estimated_hours")]
    pub hours: f64,
    #[serde(default)]
    pub spot: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    pub last_n: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

/// Node agents push either one point or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MetricsPush {
    One(RunMetricPoint),
    Batch(Vec<RunMetricPoint>),
}

// ── Cluster ─────────────────────────────────────────────────────────

pub async fn whoami(Extension(ctx): Extension<AuthContext>) -> Response {
    Json(json!({
        "principal": ctx.principal,
        "role": format!("{:?}", ctx.role).to_lowercase(),
    }))
    .into_response()
}

pub async fn cluster_status(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let summary = st.cluster.lock().await.summary();
    Json(summary).into_response()
}

pub async fn cluster_cost(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<CostQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let estimate = st
        .cluster
        .lock()
        .await
        .estimate_cost(q.num_gpus, q.hours, q.spot);
    match estimate {
        Ok(e) => Json(e).into_response(),
        Err(err) => api_error(err),
    }
}

// ── Nodes ───────────────────────────────────────────────────────────

pub async fn list_nodes(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<ListQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let health = match parse_filter::<NodeHealth>(q.status.as_deref()) {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let cluster = st.cluster.lock().await;
    Json(Page::paginate(cluster.nodes(health), q.limit, q.offset)).into_response()
}

pub async fn get_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.node(&id) {
        Ok(node) => Json(node).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn register_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(spec): Json<NodeSpec>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let result = st.cluster.lock().await.register_node(spec, Instant::now());
    match result {
        Ok(node) => {
            st.request_admission();
            (StatusCode::CREATED, Json(node)).into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn decommission_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let result = st.cluster.lock().await.decommission_node(&id);
    match result {
        Ok(()) => {
            st.request_admission();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn node_heartbeat(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(hb): Json<Heartbeat>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let result = st.cluster.lock().await.heartbeat(&id, &hb, Instant::now());
    match result {
        Ok((node, report)) => {
            st.metrics.record_report(&report);
            st.request_admission();
            Json(node).into_response()
        }
        Err(err) => api_error(err),
    }
}

// ── Runs ────────────────────────────────────────────────────────────

pub async fn list_runs(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<RunListQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let status = match parse_filter::<RunStatus>(q.status.as_deref()) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let recipe = match parse_filter::<Recipe>(q.recipe.as_deref()) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let cluster = st.cluster.lock().await;
    let runs = cluster.runs(status, recipe).into_iter().cloned();
    Json(Page::paginate(runs, q.limit, q.offset)).into_response()
}

pub async fn get_run(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.run(&id) {
        Ok(run) => Json(run).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn launch_run(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<RunLaunch>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.submit_run(req);
    match result {
        Ok(run) => {
            tracing::info!(run_id=%run.id, principal=%ctx.principal, "run launched");
            st.request_admission();
            (StatusCode::CREATED, Json(run)).into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn cancel_run(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.cancel_run(&id);
    match result {
        Ok(run) => {
            st.request_admission();
            Json(run).into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn complete_run(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let result = st.cluster.lock().await.complete_run(&id);
    match result {
        Ok(run) => {
            st.request_admission();
            Json(run).into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn fail_run(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Option<Json<RunFailure>>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let reason = body.map(|Json(f)| f.reason).unwrap_or_default();
    let result = st.cluster.lock().await.fail_run(&id, &reason);
    match result {
        Ok((run, report)) => {
            st.metrics.record_report(&report);
            st.request_admission();
            Json(run).into_response()
        }
        Err(err) => api_error(err),
    }
}

pub async fn record_run_metrics(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(push): Json<MetricsPush>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let points = match push {
        MetricsPush::One(p) => vec![p],
        MetricsPush::Batch(ps) => ps,
    };
    let recorded = points.len();
    for point in points {
        if let Err(err) = st.run_metrics.record(&id, point) {
            return api_error(err);
        }
    }
    (StatusCode::ACCEPTED, Json(json!({ "recorded": recorded }))).into_response()
}

pub async fn get_run_metrics(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(q): Query<MetricsQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.run_metrics.series(&id, q.last_n) {
        Ok(points) => Json(json!({ "run_id": id, "metrics": points })).into_response(),
        Err(err) => api_error(err),
    }
}

// ── Datasets ────────────────────────────────────────────────────────

pub async fn list_datasets(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<DatasetListQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let filter = DatasetFilter {
        name: q.name.as_deref().filter(|n| !n.is_empty()),
        version: q.version.as_deref().filter(|v| !v.is_empty()),
        tag: q.tag.as_deref().filter(|t| !t.is_empty()),
    };
    let cluster = st.cluster.lock().await;
    let datasets = cluster.datasets(filter).into_iter().cloned();
    Json(Page::paginate(datasets, q.limit, q.offset)).into_response()
}

pub async fn get_dataset(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.dataset(&id) {
        Ok(dataset) => Json(dataset).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn register_dataset(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<DatasetRegister>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.register_dataset(req);
    match result {
        Ok(dataset) => (StatusCode::CREATED, Json(dataset)).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn dataset_lineage(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.dataset_lineage(&id) {
        Ok(chain) => Json(chain).into_response(),
        Err(err) => api_error(err),
    }
}

/// Body is the list of field names to check.
pub async fn scan_dataset_pii(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(fields): Json<Vec<String>>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.scan_dataset_pii(&id, &fields) {
        Ok(scan) => Json(scan).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn delete_dataset(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.delete_dataset(&id);
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => api_error(err),
    }
}

// ── Models and evals ────────────────────────────────────────────────

pub async fn list_models(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<ModelListQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let stage = match parse_filter::<ModelStage>(q.stage.as_deref()) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let name = q.name.as_deref().filter(|n| !n.is_empty());
    let cluster = st.cluster.lock().await;
    let models = cluster.models(stage, name).into_iter().cloned();
    Json(Page::paginate(models, q.limit, q.offset)).into_response()
}

pub async fn get_model(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    match st.cluster.lock().await.model(&id) {
        Ok(model) => Json(model).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn promote_model(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ModelPromote>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.promote_model(req);
    match result {
        Ok(model) => (StatusCode::CREATED, Json(model)).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn set_model_stage(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(req): Json<StageChange>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return resp;
    }
    let result = st.cluster.lock().await.set_model_stage(&id, req.stage);
    match result {
        Ok(model) => Json(model).into_response(),
        Err(err) => api_error(err),
    }
}

pub async fn list_evals(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<EvalListQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let status = match parse_filter::<EvalStatus>(q.status.as_deref()) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let model_id = q.model_id.as_deref().filter(|m| !m.is_empty());
    let cluster = st.cluster.lock().await;
    let evals = cluster.evals(status, model_id).into_iter().cloned();
    Json(Page::paginate(evals, q.limit, q.offset)).into_response()
}

pub async fn record_eval(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(report): Json<EvalReport>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Agent) {
        return resp;
    }
    let result = st.cluster.lock().await.record_eval(report);
    match result {
        Ok(eval) => (StatusCode::CREATED, Json(eval)).into_response(),
        Err(err) => api_error(err),
    }
}

// ── Events ──────────────────────────────────────────────────────────

pub async fn list_events(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(q): Query<EventsQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    Json(st.feed.since(q.since.unwrap_or(0), q.limit)).into_response()
}

/// SSE push feed. Resumes after `since` or the `Last-Event-ID` header when given.
pub async fn event_stream(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Query(q): Query<EventsQuery>,
) -> Response {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return resp;
    }
    let since = q.since.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    });

    let stream = st.feed.stream(since).map(|ev| {
        let sse = SseEvent::default()
            .id(ev.seq.to_string())
            .event(ev.kind.name());
        Ok::<_, Infallible>(match sse.json_data(&ev) {
            Ok(sse) => sse,
            Err(err) => SseEvent::default().comment(format!("encode error: {err}")),
        })
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

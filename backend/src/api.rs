//! Web API Module
//!
//! Exposes the mentor runtime over JSON endpoints. Core calls take locks and
//! may wait on capabilities, so every handler runs them on the blocking pool.

use crate::error::ApiError;
use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use automentor_core::agent::planner::PlanningStrategy;
use automentor_core::agent::types::{GoalStatus, MemoryKind, ReflectionType, SmartCriteria, TaskStatus};
use automentor_core::{AgentError, AgentResult, AgentRuntime};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================
// APPLICATION STATE
// ============================================================

/// Shared application state
pub struct AppState {
    pub runtime: Arc<AgentRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }
}

// ============================================================
// REQUEST / RESPONSE TYPES
// ============================================================

#[derive(Debug, Deserialize)]
pub struct RememberRequest {
    pub user_id: String,
    pub text: String,
    pub kind: Option<MemoryKind>,
}

#[derive(Debug, Deserialize)]
pub struct RecallRequest {
    pub user_id: String,
    pub query: String,
    pub k: Option<usize>,
    /// Recency half-life in days; the configured default when absent
    pub half_life_days: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub user_id: String,
    pub query: String,
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalRequest {
    pub user_id: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct GoalListQuery {
    pub status: Option<GoalStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AbandonGoalRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlanRequest {
    pub strategy: Option<PlanningStrategy>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct ReflectionRequest {
    pub user_id: String,
    #[serde(default)]
    pub goal_ids: Vec<String>,
    pub reflection_type: Option<ReflectionType>,
}

#[derive(Debug, Deserialize)]
pub struct CadenceRequest {
    pub cadence: ReflectionType,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: &str) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }
    }
}

const DEFAULT_RECALL_K: usize = 5;
const DEFAULT_TREND_DAYS: i64 = 30;

type Data = web::Data<Arc<AppState>>;

/// Run a core call on the blocking pool
async fn blocking<T, F>(data: &Data, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AgentRuntime) -> AgentResult<T> + Send + 'static,
{
    let runtime = Arc::clone(&data.runtime);
    Ok(web::block(move || call(&runtime)).await??)
}

/// Convert a requested half-life in days, rejecting values chrono cannot hold
fn half_life_from_days(days: f64) -> AgentResult<chrono::Duration> {
    let millis = days * 86_400_000.0;
    if !millis.is_finite() || millis < 1.0 || millis > i64::MAX as f64 {
        return Err(AgentError::validation(format!(
            "half_life_days must be a positive finite number, got {}",
            days
        )));
    }
    chrono::Duration::try_milliseconds(millis as i64)
        .ok_or_else(|| AgentError::validation(format!("half_life_days {} is out of range", days)))
}

fn ok<T: Serialize>(data: T) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(ApiResponse::success(data)))
}

// ============================================================
// API HANDLERS
// ============================================================

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "AutoMentor API",
        "version": automentor_core::get_version()
    }))
}

/// Store a memory, reinforcing a near-duplicate if one exists
async fn remember(data: Data, req: web::Json<RememberRequest>) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let kind = req.kind.unwrap_or(MemoryKind::Interaction);
    ok(blocking(&data, move |rt| rt.memory.remember(&req.user_id, &req.text, kind)).await?)
}

async fn recall(data: Data, req: web::Json<RecallRequest>) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let recalled = blocking(&data, move |rt| {
        let half_life = match req.half_life_days {
            Some(days) => half_life_from_days(days)?,
            None => rt.memory.default_half_life(),
        };
        let k = req.k.unwrap_or(DEFAULT_RECALL_K);
        rt.memory.recall(&req.user_id, &req.query, k, half_life)
    })
    .await?;
    ok(recalled)
}

async fn memory_context(data: Data, req: web::Json<ContextRequest>) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let context = blocking(&data, move |rt| {
        let max_tokens = req.max_tokens.unwrap_or(rt.config.memory.context_max_tokens);
        rt.memory.build_context(&req.user_id, &req.query, max_tokens)
    })
    .await?;
    ok(context)
}

async fn memory_stats(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    ok(blocking(&data, move |rt| Ok(rt.memory.stats(&user_id))).await?)
}

/// Start a goal and return the clarifying questions for its empty SMART fields
async fn create_goal(data: Data, req: web::Json<CreateGoalRequest>) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let draft = blocking(&data, move |rt| {
        rt.goals.create_collaborative_goal(&req.user_id, &req.description)
    })
    .await?;
    ok(draft)
}

async fn list_goals(
    data: Data,
    path: web::Path<String>,
    query: web::Query<GoalListQuery>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let status = query.status;
    ok(blocking(&data, move |rt| Ok(rt.goals.list_goals(&user_id, status))).await?)
}

async fn goal_analytics(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let analytics = blocking(&data, move |rt| {
        Ok(rt.goals.goal_analytics(&user_id, Utc::now().date_naive()))
    })
    .await?;
    ok(analytics)
}

async fn get_goal(data: Data, path: web::Path<(String, String)>) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id) = path.into_inner();
    ok(blocking(&data, move |rt| rt.goals.get_goal(&user_id, &goal_id)).await?)
}

/// Merge SMART answers and finalize; 422 while fields are still missing
async fn finalize_goal(
    data: Data,
    path: web::Path<(String, String)>,
    answers: web::Json<SmartCriteria>,
) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id) = path.into_inner();
    let answers = answers.into_inner();
    let goal = blocking(&data, move |rt| rt.finalize_goal(&user_id, &goal_id, &answers)).await?;
    ok(goal)
}

async fn abandon_goal(
    data: Data,
    path: web::Path<(String, String)>,
    req: Option<web::Json<AbandonGoalRequest>>,
) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id) = path.into_inner();
    let reason = req.and_then(|r| r.into_inner().reason);
    let goal = blocking(&data, move |rt| {
        rt.goals.abandon_goal(&user_id, &goal_id, reason.as_deref())
    })
    .await?;
    ok(goal)
}

async fn create_plan(
    data: Data,
    path: web::Path<(String, String)>,
    req: Option<web::Json<PlanRequest>>,
) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id) = path.into_inner();
    let strategy = req
        .and_then(|r| r.into_inner().strategy)
        .unwrap_or(PlanningStrategy::Adaptive);
    let plan = blocking(&data, move |rt| {
        rt.planner.create_comprehensive_plan(&user_id, &goal_id, strategy)
    })
    .await?;
    ok(plan)
}

async fn list_tasks(data: Data, path: web::Path<(String, String)>) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id) = path.into_inner();
    ok(blocking(&data, move |rt| rt.planner.tasks(&user_id, &goal_id)).await?)
}

async fn update_task(
    data: Data,
    path: web::Path<(String, String, String)>,
    req: web::Json<UpdateTaskRequest>,
) -> Result<HttpResponse, ApiError> {
    let (user_id, goal_id, task_id) = path.into_inner();
    let status = req.status;
    let task = blocking(&data, move |rt| {
        rt.planner.update_task_status(&user_id, &goal_id, &task_id, status)
    })
    .await?;
    ok(task)
}

/// Run a reflection now (on-demand unless another type is given)
async fn reflect(data: Data, req: web::Json<ReflectionRequest>) -> Result<HttpResponse, ApiError> {
    let req = req.into_inner();
    let reflection_type = req.reflection_type.unwrap_or(ReflectionType::OnDemand);
    let report = blocking(&data, move |rt| {
        rt.evaluator
            .conduct_reflection(&req.user_id, &req.goal_ids, reflection_type)
    })
    .await?;
    ok(report)
}

async fn list_reflections(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    ok(blocking(&data, move |rt| Ok(rt.evaluator.reports(&user_id))).await?)
}

async fn progress(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    ok(blocking(&data, move |rt| Ok(rt.evaluator.progress_snapshot(&user_id))).await?)
}

async fn progress_trends(
    data: Data,
    path: web::Path<String>,
    query: web::Query<TrendQuery>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let days = query.days.unwrap_or(DEFAULT_TREND_DAYS);
    let trends = blocking(&data, move |rt| {
        let window = chrono::Duration::try_days(days)
            .ok_or_else(|| AgentError::validation(format!("days {} is out of range", days)))?;
        rt.evaluator.progress_trends(&user_id, window)
    })
    .await?;
    ok(trends)
}

async fn set_preference(
    data: Data,
    path: web::Path<String>,
    req: web::Json<PreferenceRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let req = req.into_inner();
    let upsert = blocking(&data, move |rt| {
        rt.memory.store_user_preference(&user_id, &req.key, &req.value)
    })
    .await?;
    ok(upsert)
}

async fn list_preferences(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    ok(blocking(&data, move |rt| Ok(rt.memory.user_preferences(&user_id))).await?)
}

async fn set_cadence(
    data: Data,
    path: web::Path<String>,
    req: web::Json<CadenceRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let cadence = req.cadence;
    let trigger = blocking(&data, move |rt| rt.orchestrator.set_cadence(&user_id, cadence)).await?;
    ok(trigger)
}

async fn pending_triggers(data: Data, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    ok(blocking(&data, move |rt| Ok(rt.orchestrator.pending_triggers(&user_id))).await?)
}

/// Fire every trigger that is due now, outside the background loop
async fn run_triggers(data: Data) -> Result<HttpResponse, ApiError> {
    ok(blocking(&data, |rt| Ok(rt.orchestrator.run_due(Utc::now()))).await?)
}

// ============================================================
// SERVER CONFIGURATION
// ============================================================

/// Register every route; shared by the server and handler tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/api/memory", web::post().to(remember))
        .route("/api/memory/recall", web::post().to(recall))
        .route("/api/memory/context", web::post().to(memory_context))
        .route("/api/memory/{user_id}/stats", web::get().to(memory_stats))
        .route("/api/goals", web::post().to(create_goal))
        .route("/api/goals/{user_id}", web::get().to(list_goals))
        .route("/api/goals/{user_id}/analytics", web::get().to(goal_analytics))
        .route("/api/goals/{user_id}/{goal_id}", web::get().to(get_goal))
        .route("/api/goals/{user_id}/{goal_id}/finalize", web::post().to(finalize_goal))
        .route("/api/goals/{user_id}/{goal_id}/abandon", web::post().to(abandon_goal))
        .route("/api/goals/{user_id}/{goal_id}/plan", web::post().to(create_plan))
        .route("/api/goals/{user_id}/{goal_id}/tasks", web::get().to(list_tasks))
        .route("/api/goals/{user_id}/{goal_id}/tasks/{task_id}", web::post().to(update_task))
        .route("/api/reflection", web::post().to(reflect))
        .route("/api/reflection/{user_id}", web::get().to(list_reflections))
        .route("/api/progress/{user_id}", web::get().to(progress))
        .route("/api/progress/{user_id}/trends", web::get().to(progress_trends))
        .route("/api/users/{user_id}/cadence", web::post().to(set_cadence))
        .route("/api/users/{user_id}/preferences", web::post().to(set_preference))
        .route("/api/users/{user_id}/preferences", web::get().to(list_preferences))
        .route("/api/users/{user_id}/triggers", web::get().to(pending_triggers))
        .route("/api/triggers/run", web::post().to(run_triggers));
}

/// Configure and run the API server
pub async fn run_server(runtime: Arc<AgentRuntime>, host: &str, port: u16) -> std::io::Result<()> {
    let state = Arc::new(AppState::new(runtime));

    log::info!("[API] AutoMentor API starting at http://{}:{}", host, port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}

//! Operator-facing HTTP surface: a thin axum layer over the distributor,
//! resource monitor, fabric, and quality controller. Every handler just
//! validates its request shape and delegates; the components underneath
//! hold all the real state and logic.

use crate::{
    auth::{auth_middleware, create_auth_state},
    config::{ApiConfig, Config},
    distributor::{Distributor, TaskOutcome},
    error::AwcpError,
    fabric::{Delivery, DeliveryStatus, Fabric, Message},
    models::{AgentId, Task, TaskId},
    quality::{EvaluationReport, QualityController},
    rate_limit::rate_limit_middleware,
    resource_monitor::{ForecastPoint, ResourceMonitor},
    Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SERVICE_NAME: &str = "awcp-core";
const SERVICE_VERSION: &str = "0.1.0";

const ROUTE_HEALTH: &str = "/health";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_DISTRIBUTE: &str = "/distribute";
const ROUTE_TASK_COMPLETE: &str = "/tasks/{task_id}/complete";
const ROUTE_CLIENT_TASKS: &str = "/clients/{client_id}/tasks";
const ROUTE_WORKFLOWS: &str = "/workflows";
const ROUTE_RESOURCES: &str = "/resources";
const ROUTE_RESOURCE_USAGE: &str = "/resources/{resource_id}/usage";
const ROUTE_RESOURCE_FORECAST: &str = "/resources/{resource_id}/forecast";
const ROUTE_CLIENT_USAGE: &str = "/clients/{client_id}/usage";
const ROUTE_MESSAGES: &str = "/messages";
const ROUTE_QUALITY_EVALUATE: &str = "/quality/evaluate";
const ROUTE_QUALITY_FEEDBACK: &str = "/quality/feedback";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    distributor: Distributor,
    resource_monitor: ResourceMonitor,
    fabric: Fabric,
    quality: QualityController,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(e: AwcpError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        AwcpError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        AwcpError::PolicyDenied(_) => StatusCode::FORBIDDEN,
        AwcpError::NotAuthorized(_) => StatusCode::UNAUTHORIZED,
        AwcpError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AwcpError::NotFound(_) => StatusCode::NOT_FOUND,
        AwcpError::Integrity(_) => StatusCode::CONFLICT,
        AwcpError::Configuration(_) | AwcpError::Serialization(_) | AwcpError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse { error: e.to_string(), details: None }))
}

impl ApiServer {
    pub fn new(
        config: Config,
        distributor: Distributor,
        resource_monitor: ResourceMonitor,
        fabric: Fabric,
        quality: QualityController,
    ) -> Self {
        Self {
            config: config.api,
            distributor,
            resource_monitor,
            fabric,
            quality,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(|e| AwcpError::Internal(e.into()))?;

        info!("API server listening on {}:{}", self.config.host, self.config.port);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(|e| AwcpError::Internal(e.into()))?;

        Ok(())
    }

    /// Order matters: rate limit -> auth -> trace -> CORS -> routes.
    pub fn build_router(&self) -> Router {
        let auth_state = create_auth_state(self.config.clone());

        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-api-key"),
            ])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_AGENTS, post(register_agent))
            .route(ROUTE_TASKS, post(submit_task))
            .route(ROUTE_DISTRIBUTE, post(distribute))
            .route(ROUTE_TASK_COMPLETE, post(complete_task))
            .route(ROUTE_CLIENT_TASKS, get(get_client_tasks))
            .route(ROUTE_WORKFLOWS, post(start_workflow))
            .route(ROUTE_RESOURCES, post(register_resource))
            .route(ROUTE_RESOURCE_USAGE, post(update_resource_usage))
            .route(ROUTE_RESOURCE_FORECAST, get(forecast_resource))
            .route(ROUTE_CLIENT_USAGE, get(get_client_usage))
            .route(ROUTE_MESSAGES, post(send_message))
            .route(ROUTE_QUALITY_EVALUATE, post(evaluate_quality))
            .route(ROUTE_QUALITY_FEEDBACK, post(record_feedback))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(rate_limit_middleware))
                    .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    agent_id: String,
    #[serde(default)]
    capabilities: HashSet<String>,
    capacity: u32,
    #[serde(default)]
    client_id: Option<String>,
}

async fn register_agent(
    State(server): State<ApiServer>,
    Json(request): Json<RegisterAgentRequest>,
) -> std::result::Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    server
        .distributor
        .register_agent(request.agent_id, request.capabilities, request.capacity, request.client_id)
        .await
        .map(|_| StatusCode::CREATED)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    task_type: String,
    #[serde(default)]
    requirements: HashSet<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: TaskId,
}

async fn submit_task(
    State(server): State<ApiServer>,
    Json(request): Json<SubmitTaskRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitTaskResponse>), (StatusCode, Json<ErrorResponse>)> {
    server
        .distributor
        .submit_task(request.task_type, request.requirements, request.priority, request.client_id, request.payload)
        .await
        .map(|task_id| (StatusCode::CREATED, Json(SubmitTaskResponse { task_id })))
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct DistributeRequest {
    #[serde(default)]
    client_id: Option<String>,
}

async fn distribute(
    State(server): State<ApiServer>,
    Json(request): Json<DistributeRequest>,
) -> std::result::Result<Json<HashMap<TaskId, AgentId>>, (StatusCode, Json<ErrorResponse>)> {
    server
        .distributor
        .distribute(request.client_id.as_deref())
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskOutcomeDto {
    Completed,
    Failed,
}

impl From<TaskOutcomeDto> for TaskOutcome {
    fn from(dto: TaskOutcomeDto) -> Self {
        match dto {
            TaskOutcomeDto::Completed => TaskOutcome::Completed,
            TaskOutcomeDto::Failed => TaskOutcome::Failed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompleteTaskRequest {
    outcome: TaskOutcomeDto,
}

async fn complete_task(
    State(server): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(request): Json<CompleteTaskRequest>,
) -> std::result::Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    server
        .distributor
        .complete_task(&task_id, request.outcome.into())
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

async fn get_client_tasks(
    State(server): State<ApiServer>,
    Path(client_id): Path<String>,
) -> Json<Vec<Task>> {
    Json(server.distributor.get_client_tasks(&client_id).await)
}

#[derive(Debug, Deserialize)]
struct StartWorkflowRequest {
    state_machine: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkflowHandleResponse {
    execution_name: Option<String>,
    reference: Option<String>,
}

async fn start_workflow(
    State(server): State<ApiServer>,
    Json(request): Json<StartWorkflowRequest>,
) -> Json<WorkflowHandleResponse> {
    let handle = server
        .distributor
        .start_workflow(&request.state_machine, request.input, request.client_id.as_deref())
        .await;
    match handle {
        Some(h) => Json(WorkflowHandleResponse {
            execution_name: Some(h.execution_name),
            reference: Some(h.reference),
        }),
        None => Json(WorkflowHandleResponse { execution_name: None, reference: None }),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterResourceRequest {
    resource_id: String,
    capacity: f64,
    warning: f64,
    critical: f64,
    #[serde(default)]
    client_id: Option<String>,
}

async fn register_resource(
    State(server): State<ApiServer>,
    Json(request): Json<RegisterResourceRequest>,
) -> std::result::Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    server
        .resource_monitor
        .register_resource(request.resource_id, request.capacity, request.warning, request.critical, request.client_id)
        .await
        .map(|_| StatusCode::CREATED)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct UpdateUsageRequest {
    used: f64,
    #[serde(default)]
    client_id: Option<String>,
}

async fn update_resource_usage(
    State(server): State<ApiServer>,
    Path(resource_id): Path<String>,
    Json(request): Json<UpdateUsageRequest>,
) -> std::result::Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    server
        .resource_monitor
        .update_usage(&resource_id, request.used, request.client_id.as_deref())
        .await
        .map(|_| StatusCode::OK)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct ForecastQuery {
    #[serde(default = "default_horizon_hours")]
    horizon_hours: u32,
}

fn default_horizon_hours() -> u32 {
    24
}

async fn forecast_resource(
    State(server): State<ApiServer>,
    Path(resource_id): Path<String>,
    Query(query): Query<ForecastQuery>,
) -> std::result::Result<Json<Vec<ForecastPoint>>, (StatusCode, Json<ErrorResponse>)> {
    let points = server
        .resource_monitor
        .forecast(&resource_id, query.horizon_hours)
        .await
        .map_err(error_response)?;
    Ok(Json(points))
}

async fn get_client_usage(
    State(server): State<ApiServer>,
    Path(client_id): Path<String>,
) -> Json<HashMap<String, Vec<f64>>> {
    Json(server.resource_monitor.get_client_usage(&client_id).await)
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    recipient: String,
    message_type: String,
    content: serde_json::Value,
    #[serde(default)]
    sender_id: Option<AgentId>,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    delivery: String,
}

fn delivery_label(delivery: &Delivery) -> String {
    match delivery.status {
        DeliveryStatus::Delivered => "delivered".to_string(),
        DeliveryStatus::Sent => "sent".to_string(),
        DeliveryStatus::Queued => "queued".to_string(),
        DeliveryStatus::Pending => "pending".to_string(),
        DeliveryStatus::Failed => "failed".to_string(),
    }
}

async fn send_message(
    State(server): State<ApiServer>,
    Json(request): Json<SendMessageRequest>,
) -> std::result::Result<Json<SendMessageResponse>, (StatusCode, Json<ErrorResponse>)> {
    let message = Message::new(request.recipient, request.message_type, request.content, request.sender_id);
    server
        .fabric
        .send(message)
        .await
        .map(|delivery| Json(SendMessageResponse { delivery: delivery_label(&delivery) }))
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    task_type: String,
    output: serde_json::Value,
}

async fn evaluate_quality(
    State(server): State<ApiServer>,
    Json(request): Json<EvaluateRequest>,
) -> Json<EvaluationReport> {
    Json(server.quality.evaluate(&request.task_type, &request.output).await)
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    task_id: String,
    task_type: String,
    #[serde(default)]
    agent_id: Option<AgentId>,
    source: String,
    content: String,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    client_id: Option<String>,
}

async fn record_feedback(
    State(server): State<ApiServer>,
    Json(request): Json<FeedbackRequest>,
) -> StatusCode {
    if request.agent_id.is_none() && request.source == "anonymous" {
        server.quality.record_anonymized(request.task_id, request.content, request.rating).await;
    } else {
        server
            .quality
            .record_feedback(
                request.task_id,
                request.task_type,
                request.agent_id,
                request.source,
                request.content,
                request.rating,
                request.score,
                request.client_id,
            )
            .await;
    }
    StatusCode::CREATED
}

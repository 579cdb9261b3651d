mod config;
mod error;
mod facade;
mod queue;
mod registry;
mod session_manager;
mod state;
mod telemetry;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use caramba_db::repositories::maintenance::run_daily_maintenance;
use caramba_shared::management::{
    BatchUserOperationRequest, Page, PageRequest, TrafficQuery, TrafficRecordView, UpdateNodeConfigRequest,
    UpdateUserRequest,
};
use caramba_shared::node_plane::{
    ExecuteUserCommandRequest, ExecuteUserCommandResponse, GetNodeStatusResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterNodeRequest, RegisterNodeResponse, ReportMetricsRequest, ReportMetricsResponse, ReportTrafficRequest,
    ReportTrafficResponse, RestartSingBoxRequest, RestartSingBoxResponse, UpdateConfigRequest, UpdateConfigResponse,
};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{Cli, Command, Config};
use error::ControlResult;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env file loaded: {e}");
    }

    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        println!("control-api {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let file_appender = tracing_appender::rolling::never(".", "control-api.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "caramba_panel=info,axum=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let listen_addr = config.listen_addr();

    let request_timeout = config.request_timeout();
    let pool = caramba_db::connect(&config.database_url).await.context("failed to connect to database")?;
    let state = Arc::new(AppState::new(config, pool));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(session_manager::run_reaper(state.clone(), shutdown_rx.clone()));
    tokio::spawn(session_manager::persist_heartbeats_periodically(state.clone(), shutdown_rx.clone()));
    tokio::spawn(run_daily_maintenance_loop(state.clone(), shutdown_rx.clone()));

    let app = build_router((*state).clone(), request_timeout);

    tracing::info!(addr = %listen_addr, "control-api listening");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await.context("failed to bind listen address")?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_tx))
        .await
        .context("server error")?;

    Ok(())
}

fn build_router(state: AppState, request_timeout: std::time::Duration) -> axum::Router {
    axum::Router::new()
        // Agent Plane
        .route("/v1/agent/register", post(register_node))
        .route("/v1/agent/heartbeat", post(heartbeat))
        .route("/v1/agent/metrics", post(report_metrics))
        .route("/v1/agent/traffic", post(report_traffic))
        .route("/v1/agent/config", post(update_config))
        .route("/v1/agent/execute-command", post(execute_user_command))
        .route("/v1/agent/restart", post(restart_sing_box))
        .route("/v1/agent/status/{node_id}", get(get_node_status))
        // Management Plane
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/nodes/{node_id}", get(get_node).delete(remove_node))
        .route("/v1/nodes/{node_id}/config", post(update_node_config))
        .route("/v1/nodes/{node_id}/metrics", get(get_node_metrics))
        .route("/v1/nodes/{node_id}/traffic", get(get_node_traffic))
        .route("/v1/users", get(list_users).post(create_user))
        .route("/v1/users/{user_id}", get(get_user).put(update_user).delete(delete_user))
        .route("/v1/users/{user_id}/traffic", get(get_user_traffic))
        .route("/v1/users/batch", post(batch_user_operation))
        .route("/v1/plans", get(list_plans).post(upsert_plan))
        .route("/v1/plans/{plan_id}", get(get_plan).delete(delete_plan))
        .route("/v1/system/overview", get(get_system_overview))
        .route("/v1/system/config", get(get_global_config).put(update_global_config))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(10 * 1024 * 1024))
        .layer(
            tower::ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_timeout_error))
                .layer(tower_http::timeout::TimeoutLayer::new(request_timeout)),
        )
}

/// Every RPC handler is wrapped in a request deadline; a lapsed
/// one surfaces as `deadline_exceeded` instead of the connection just
/// dropping silently.
async fn handle_timeout_error(error: tower::BoxError) -> error::ControlError {
    if error.is::<tower::timeout::error::Elapsed>() {
        error::ControlError::DeadlineExceeded("request exceeded the configured timeout".to_string())
    } else {
        error::ControlError::Internal(anyhow::anyhow!("unhandled middleware error: {error}"))
    }
}

async fn wait_for_shutdown(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, notifying background tasks");
    let _ = shutdown_tx.send(true);
}

async fn run_daily_maintenance_loop(state: Arc<AppState>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let today = chrono::Utc::now().date_naive();
                match run_daily_maintenance(&state.traffic, today, state.config.traffic_retention_days, state.config.summary_retention_days).await {
                    Ok(report) => tracing::info!(?report, "daily maintenance completed"),
                    Err(e) => tracing::error!(error = %e, "daily maintenance failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ----------------------------------------------------------- Agent Plane --

async fn register_node(State(state): State<AppState>, Json(req): Json<RegisterNodeRequest>) -> ControlResult<Json<RegisterNodeResponse>> {
    let resp = session_manager::register_node(&state, &req.node_id, &req.name, &req.host, i32::from(req.port), req.version.as_deref()).await?;
    Ok(Json(resp))
}

async fn heartbeat(State(state): State<AppState>, Json(req): Json<HeartbeatRequest>) -> ControlResult<Json<HeartbeatResponse>> {
    let (success, pending_commands) = session_manager::heartbeat(&state, &req.node_id, req.status).await?;
    Ok(Json(HeartbeatResponse { success, pending_commands }))
}

async fn report_metrics(State(state): State<AppState>, Json(req): Json<ReportMetricsRequest>) -> ControlResult<Json<ReportMetricsResponse>> {
    telemetry::report_metrics(&state, &req.node_id, req.metrics).await?;
    Ok(Json(ReportMetricsResponse { success: true }))
}

async fn report_traffic(State(state): State<AppState>, Json(req): Json<ReportTrafficRequest>) -> ControlResult<Json<ReportTrafficResponse>> {
    let quota_exceeded = telemetry::report_traffic(&state, &req.node_id, &req.entries).await?;
    Ok(Json(ReportTrafficResponse { success: true, quota_exceeded }))
}

async fn update_config(State(state): State<AppState>, Json(req): Json<UpdateConfigRequest>) -> ControlResult<Json<UpdateConfigResponse>> {
    let resp = session_manager::update_config(&state, &req.node_id).await?;
    Ok(Json(resp))
}

async fn execute_user_command(
    State(state): State<AppState>,
    Json(req): Json<ExecuteUserCommandRequest>,
) -> ControlResult<Json<ExecuteUserCommandResponse>> {
    tracing::debug!(node_id = %req.node_id, command_id = %req.command_id, user_id = %req.user_id, "resolving user command");
    let resp = session_manager::execute_user_command(&state, &req.user_id).await?;
    Ok(Json(resp))
}

async fn restart_sing_box(State(state): State<AppState>, Json(req): Json<RestartSingBoxRequest>) -> ControlResult<Json<RestartSingBoxResponse>> {
    let success = session_manager::restart_sing_box(&state, &req.node_id, req.reason.as_deref()).await?;
    Ok(Json(RestartSingBoxResponse { success }))
}

async fn get_node_status(State(state): State<AppState>, Path(node_id): Path<String>) -> ControlResult<Json<GetNodeStatusResponse>> {
    let resp = session_manager::get_node_status(&state, &node_id).await?;
    Ok(Json(resp))
}

// ------------------------------------------------------- Management Plane --

async fn list_nodes(State(state): State<AppState>, Query(page): Query<PageRequest>) -> ControlResult<Json<Page<caramba_shared::management::NodeView>>> {
    Ok(Json(facade::list_nodes(&state, page).await?))
}

async fn get_node(State(state): State<AppState>, Path(node_id): Path<String>) -> ControlResult<Json<caramba_shared::management::NodeView>> {
    Ok(Json(facade::get_node(&state, &node_id).await?))
}

async fn remove_node(State(state): State<AppState>, Path(node_id): Path<String>) -> ControlResult<Json<serde_json::Value>> {
    facade::remove_node(&state, &node_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn update_node_config(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(mut req): Json<UpdateNodeConfigRequest>,
) -> ControlResult<Json<caramba_shared::management::NodeView>> {
    req.node_id = node_id;
    Ok(Json(facade::update_node_config(&state, req).await?))
}

#[derive(serde::Deserialize)]
struct CreateUserBody {
    username: String,
    email: String,
    password_hash: String,
    plan_id: Option<String>,
    #[serde(default)]
    traffic_quota: i64,
    #[serde(default)]
    device_limit: i32,
    #[serde(default)]
    speed_limit_mbps: i32,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserBody>,
) -> ControlResult<Json<caramba_shared::management::UserView>> {
    let view = facade::create_user(
        &state,
        &body.username,
        &body.email,
        &body.password_hash,
        body.plan_id.as_deref(),
        body.traffic_quota,
        body.device_limit,
        body.speed_limit_mbps,
        body.expires_at,
    )
    .await?;
    Ok(Json(view))
}

async fn list_plans(State(state): State<AppState>, Query(page): Query<PageRequest>) -> ControlResult<Json<Page<caramba_shared::management::PlanView>>> {
    Ok(Json(facade::list_plans(&state, page).await?))
}

async fn get_plan(State(state): State<AppState>, Path(plan_id): Path<String>) -> ControlResult<Json<caramba_shared::management::PlanView>> {
    Ok(Json(facade::get_plan(&state, &plan_id).await?))
}

#[derive(serde::Deserialize)]
struct UpsertPlanBody {
    plan_id: String,
    name: String,
    period_days: i32,
    price_cents: i64,
    #[serde(default)]
    traffic_quota: i64,
    #[serde(default)]
    device_limit: i32,
    #[serde(default)]
    speed_limit_mbps: i32,
    #[serde(default)]
    connection_limit: i32,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    max_users: i32,
    #[serde(default)]
    features: serde_json::Value,
}

fn default_true() -> bool {
    true
}

async fn upsert_plan(
    State(state): State<AppState>,
    Json(body): Json<UpsertPlanBody>,
) -> ControlResult<Json<caramba_shared::management::PlanView>> {
    let view = facade::upsert_plan(
        &state,
        &caramba_db::repositories::plan_repo::UpsertPlanFields {
            plan_id: &body.plan_id,
            name: &body.name,
            period_days: body.period_days,
            price_cents: body.price_cents,
            traffic_quota: body.traffic_quota,
            device_limit: body.device_limit,
            speed_limit_mbps: body.speed_limit_mbps,
            connection_limit: body.connection_limit,
            enabled: body.enabled,
            max_users: body.max_users,
            features: &body.features,
        },
    )
    .await?;
    Ok(Json(view))
}

async fn delete_plan(State(state): State<AppState>, Path(plan_id): Path<String>) -> ControlResult<Json<serde_json::Value>> {
    facade::delete_plan(&state, &plan_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn get_node_metrics(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> ControlResult<Json<caramba_shared::node_plane::MetricsSnapshot>> {
    Ok(Json(facade::get_node_metrics(&state, &node_id).await?))
}

async fn get_node_traffic(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<TrafficQuery>,
) -> ControlResult<Json<Page<TrafficRecordView>>> {
    Ok(Json(facade::get_node_traffic(&state, &node_id, query).await?))
}

async fn get_user_traffic(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TrafficQuery>,
) -> ControlResult<Json<Page<TrafficRecordView>>> {
    Ok(Json(facade::get_user_traffic(&state, &user_id, query).await?))
}

async fn list_users(State(state): State<AppState>, Query(page): Query<PageRequest>) -> ControlResult<Json<Page<caramba_shared::management::UserView>>> {
    Ok(Json(facade::list_users(&state, page).await?))
}

async fn get_user(State(state): State<AppState>, Path(user_id): Path<String>) -> ControlResult<Json<caramba_shared::management::UserView>> {
    Ok(Json(facade::get_user(&state, &user_id).await?))
}

async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> ControlResult<Json<caramba_shared::management::UserView>> {
    Ok(Json(facade::update_user(&state, &user_id, req).await?))
}

async fn delete_user(State(state): State<AppState>, Path(user_id): Path<String>) -> ControlResult<Json<serde_json::Value>> {
    facade::delete_user(&state, &user_id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn batch_user_operation(
    State(state): State<AppState>,
    Json(req): Json<BatchUserOperationRequest>,
) -> Json<caramba_shared::management::BatchUserOperationResponse> {
    Json(facade::batch_user_operation(&state, &req.user_ids, req.op).await)
}

async fn get_system_overview(State(state): State<AppState>) -> ControlResult<Json<caramba_shared::management::SystemOverview>> {
    Ok(Json(facade::get_system_overview(&state).await?))
}

async fn get_global_config(State(state): State<AppState>) -> ControlResult<Json<std::collections::HashMap<String, String>>> {
    Ok(Json(facade::get_global_config(&state).await?))
}

#[derive(serde::Deserialize)]
struct UpdateGlobalConfigBody {
    key: String,
    value: String,
}

async fn update_global_config(State(state): State<AppState>, Json(body): Json<UpdateGlobalConfigBody>) -> ControlResult<Json<serde_json::Value>> {
    facade::update_global_config(&state, &body.key, &body.value).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

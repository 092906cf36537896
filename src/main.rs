use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use mtlink::config::BridgeConfig;
use mtlink::domain::entities::command::{CommandKind, CommandOutcome, CommandPriority};
use mtlink::domain::entities::connection::HeartbeatMetrics;
use mtlink::domain::entities::tick::Tick;
use mtlink::domain::entities::trade::EaTradeView;
use mtlink::domain::errors::CoreError;
use mtlink::domain::services::circuit_breaker::CommandCircuitBreakers;
use mtlink::domain::services::command_dispatcher::CommandDispatcher;
use mtlink::domain::services::connection_registry::ConnectionRegistry;
use mtlink::domain::services::reconciliation::TradeReconciler;
use mtlink::domain::services::tick_pipeline::{TickBuffer, GLOBAL_SCOPE};
use mtlink::infrastructure::fast_path::InMemoryFastPath;
use mtlink::persistence::init_database;
use mtlink::task_runner::{supervise, SupervisorConfig};

struct AppState {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: CommandDispatcher,
    reconciler: TradeReconciler,
    ticks: Arc<TickBuffer>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mtlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("EA link server starting...");

    let config = BridgeConfig::from_env();
    let pool = init_database(&config.database_url).await?;

    let registry = Arc::new(ConnectionRegistry::new(config.health_policy()));
    let fast_path = Arc::new(InMemoryFastPath::new(config.command_queue_ttl()));
    let dispatcher = CommandDispatcher::new(
        pool.clone(),
        fast_path.clone(),
        registry.clone(),
        CommandCircuitBreakers::new(config.breaker_config()),
    );
    let reconciler = TradeReconciler::new(pool.clone());
    let ticks = Arc::new(TickBuffer::new(pool.clone(), config.tick_pipeline_config()));

    // Tick flush: dedicated long-lived task on a fixed interval. A failed
    // flush is the expected backpressure case during a store outage, so the
    // loop retries at flush cadence for as long as the outage lasts.
    let flush_buffer = ticks.clone();
    let flush_interval = Duration::from_secs(config.flush_interval_secs);
    tokio::spawn(async move {
        supervise(
            "tick_flush",
            SupervisorConfig::retry_indefinitely(flush_interval),
            || {
                let buffer = flush_buffer.clone();
                async move {
                    tokio::time::sleep(flush_interval).await;
                    buffer.flush().await.map(|_| ()).map_err(|e| e.to_string())
                }
            },
        )
        .await;
    });

    // Health sweep: degrade/disconnect accounts with stale heartbeats
    let sweep_registry = registry.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    let heartbeat_timeout = chrono::Duration::seconds(config.heartbeat_timeout_secs as i64);
    let disconnect_timeout = chrono::Duration::seconds(config.disconnect_timeout_secs as i64);
    tokio::spawn(async move {
        supervise(
            "health_sweep",
            SupervisorConfig::abort_after(10),
            || {
                let registry = sweep_registry.clone();
                async move {
                    tokio::time::sleep(sweep_interval).await;
                    let outcome = registry.sweep(heartbeat_timeout, disconnect_timeout).await;
                    if outcome.degraded > 0 || outcome.disconnected > 0 {
                        warn!(
                            "Health sweep: {} degraded, {} disconnected",
                            outcome.degraded, outcome.disconnected
                        );
                    }
                    Ok(())
                }
            },
        )
        .await;
    });

    let bind_addr = config.bind_addr;
    let state = Arc::new(AppState {
        config,
        registry,
        dispatcher,
        reconciler,
        ticks,
    });

    let app = Router::new()
        .route("/", get(|| async { "EA link server is running!" }))
        .route("/health", get(health_check))
        .route("/api/ea/connect", post(ea_connect))
        .route("/api/ea/heartbeat", post(ea_heartbeat))
        .route("/api/ea/commands/:account_id", get(get_commands))
        .route("/api/ea/command-response", post(command_response))
        .route("/api/ea/trades/sync", post(sync_trades))
        .route("/api/ea/ticks/batch", post(buffer_ticks))
        .route("/api/accounts/:account_id/commands", post(create_command))
        .route("/api/accounts/:account_id/status", get(account_status))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
        .with_state(state);

    info!("Listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let server = axum::serve(listener, app);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    server.with_graceful_shutdown(shutdown_signal).await?;

    info!("Server shutting down gracefully...");
    Ok(())
}

fn core_error_response(e: CoreError) -> (StatusCode, Json<Value>) {
    match e {
        CoreError::UnknownAccount(account_id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown_account", "account_id": account_id })),
        ),
        CoreError::UnknownCommand(command_id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown_command", "command_id": command_id })),
        ),
        CoreError::CircuitOpen(account_id) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "account_degraded",
                "account_id": account_id,
                "detail": "circuit open, command creation suspended until recovery"
            })),
        ),
        CoreError::Database(e) => {
            error!("Database error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal_error" })),
            )
        }
    }
}

/// Liveness plus a connection summary
async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let connections = state.registry.all().await;
    let healthy = connections
        .iter()
        .filter(|c| c.is_healthy(state.registry.policy()))
        .count();

    Json(json!({
        "status": "running",
        "connections": connections.len(),
        "healthy_connections": healthy,
        "buffered_ticks": state.ticks.pending().await,
    }))
}

#[derive(Deserialize)]
struct ConnectRequest {
    account_id: i64,
    account_number: String,
    broker: String,
}

/// EA handshake: registers (or re-registers) the account's connection
async fn ea_connect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> Json<Value> {
    let conn = state
        .registry
        .register(req.account_id, req.account_number, req.broker)
        .await;

    Json(json!({
        "account_id": conn.account_id,
        "account_number": conn.account_number,
        "state": conn.state,
        "heartbeat_interval_secs": state.config.heartbeat_timeout_secs / 2,
    }))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    account_id: i64,
    balance: f64,
    equity: f64,
    margin: f64,
    free_margin: f64,
    #[serde(default)]
    latency_ms: u32,
}

async fn ea_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let metrics = HeartbeatMetrics {
        balance: req.balance,
        equity: req.equity,
        margin: req.margin,
        free_margin: req.free_margin,
        latency_ms: req.latency_ms,
    };

    let conn = state
        .registry
        .process_heartbeat(req.account_id, metrics)
        .await
        .map_err(core_error_response)?;

    Ok(Json(json!({
        "state": conn.state,
        "health_score": conn.health_score,
        "heartbeat_count": conn.heartbeat_count,
    })))
}

/// Poll fallback: ordered pending commands, non-destructive
async fn get_commands(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let commands = state
        .dispatcher
        .get_pending_commands(account_id, state.config.pending_poll_limit)
        .await
        .map_err(core_error_response)?;

    let views: Vec<Value> = commands
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": c.kind,
                "payload": c.payload_json(),
                "priority": c.priority,
                "status": c.status,
                "created_at": c.created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "commands": views, "count": views.len() })))
}

#[derive(Deserialize)]
struct CreateCommandRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: Option<CommandPriority>,
}

async fn create_command(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
    Json(req): Json<CreateCommandRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let kind = CommandKind::from_parts(&req.kind, req.payload);
    let record = state
        .dispatcher
        .create_command(account_id, kind, req.priority.unwrap_or_default())
        .await
        .map_err(core_error_response)?;

    Ok(Json(json!({
        "id": record.id,
        "status": record.status,
        "created_at": record.created_at,
    })))
}

#[derive(Deserialize)]
struct CommandResponseRequest {
    command_id: Uuid,
    status: String,
    #[serde(default)]
    response: Option<Value>,
}

async fn command_response(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CommandResponseRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let outcome = match req.status.as_str() {
        "completed" => CommandOutcome::Completed,
        "failed" => CommandOutcome::Failed,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_status",
                    "detail": format!("status must be 'completed' or 'failed', got '{}'", other)
                })),
            ))
        }
    };

    let record = state
        .dispatcher
        .process_command_response(req.command_id, outcome, req.response)
        .await
        .map_err(core_error_response)?;

    Ok(Json(json!({
        "id": record.id,
        "status": record.status,
        "executed_at": record.executed_at,
    })))
}

#[derive(Deserialize)]
struct TradesSyncRequest {
    account_id: i64,
    trades: Vec<EaTradeView>,
}

async fn sync_trades(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradesSyncRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let report = state
        .reconciler
        .sync_trades_from_ea(req.account_id, &req.trades)
        .await
        .map_err(core_error_response)?;

    Ok(Json(json!(report)))
}

#[derive(Deserialize)]
struct TickBatchRequest {
    #[serde(default)]
    account_id: Option<i64>,
    ticks: Vec<Tick>,
}

async fn buffer_ticks(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TickBatchRequest>,
) -> Json<Value> {
    let scope = req
        .account_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| GLOBAL_SCOPE.to_string());

    let count = req.ticks.len();
    state.ticks.buffer_batch(&scope, req.ticks).await;

    Json(json!({ "buffered": count }))
}

/// Queryable degraded/open-circuit status: failures surface here, not as
/// exceptions bubbling to the UI
async fn account_status(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<i64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let connection = state.registry.get(account_id).await;
    let dispatch = state.dispatcher.dispatch_stats(account_id).await;
    let (pending, executing) = state
        .dispatcher
        .backlog(account_id)
        .await
        .map_err(core_error_response)?;
    let open_trades = state
        .reconciler
        .open_trades(account_id)
        .await
        .map_err(core_error_response)?;

    let connection_view = connection.map(|c| {
        json!({
            "state": c.state,
            "health_score": c.health_score,
            "consecutive_failures": c.consecutive_failures,
            "heartbeat_count": c.heartbeat_count,
            "last_heartbeat": c.last_heartbeat,
            "latency_ms": c.latency_ms,
        })
    });

    Ok(Json(json!({
        "account_id": account_id,
        "connection": connection_view,
        "circuit": {
            "state": dispatch.state.as_str(),
            "recent_failures": dispatch.failure_count,
        },
        "commands": { "pending": pending, "executing": executing },
        "open_trades": open_trades.len(),
    })))
}

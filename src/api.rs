//! REST surface
//!
//! The narrow HTTP contract around the core: the agent auth handshake, the
//! WebSocket upgrade route, and thin admin endpoints over the connection
//! registry, the config push manager, and the queue. Business CRUD, RBAC,
//! and pagination live elsewhere.

use crate::auth::{AuthError, ConnectionAuthenticator};
use crate::config_push::{ConfigPushManager, PendingConfig};
use crate::connection_manager::{AgentSnapshot, ConnectionManager};
use crate::domain_types::{HostId, Hostname};
use crate::hosts::HostStore;
use crate::messages::{CommandType, DEFAULT_COMMAND_TIMEOUT_SECS, JsonMap, MessageEnvelope};
use crate::queue::{HostRef, QueueDirection, QueuePriority, QueueStats, ServerMessageQueue};
use crate::router::TelemetrySink;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Shared service handles behind every route
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub connections: Arc<ConnectionManager>,
    pub queue: Arc<ServerMessageQueue>,
    pub hosts: Arc<HostStore>,
    pub auth: Arc<ConnectionAuthenticator>,
    pub config_push: Arc<ConfigPushManager>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

/// Successful `POST /agent/auth` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAuthResponse {
    pub connection_token: String,
    pub expires_in: u64,
    pub websocket_endpoint: String,
}

/// Rate-limited `POST /agent/auth` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedResponse {
    pub error: String,
    pub retry_after: u64,
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

/// Command dispatch request
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command_type: String,
    #[serde(default)]
    pub parameters: JsonMap,
    pub timeout: Option<u64>,
}

/// Command dispatch response
#[derive(Debug, Clone, Serialize)]
pub struct CommandQueuedResponse {
    pub message_id: Uuid,
}

/// Config push response for one hostname
#[derive(Debug, Clone, Serialize)]
pub struct ConfigPushResponse {
    pub hostname: String,
    pub success: bool,
}

/// Platform config push response
#[derive(Debug, Clone, Serialize)]
pub struct PlatformPushResponse {
    pub platform: String,
    pub successful_sends: usize,
}

/// Failed-message deletion request
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteFailedRequest {
    pub message_ids: Vec<Uuid>,
}

/// Failed-message deletion response
#[derive(Debug, Clone, Serialize)]
pub struct DeleteFailedResponse {
    pub deleted: u64,
}

/// Builds the application router over the shared state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/agent/auth", post(agent_auth))
        .route("/api/agent/connect", get(crate::ws::agent_connect))
        .route("/api/fleet/agents", get(list_agents))
        .route("/api/fleet/command/{host_id}", post(queue_command))
        .route("/api/config/push/{hostname}", post(push_config))
        .route("/api/config/push-all", post(push_config_all))
        .route("/api/config/push-platform/{platform}", post(push_config_platform))
        .route("/api/config/pending", get(pending_configs))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/failed/delete", post(delete_failed))
        .with_state(state)
}

async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
    })
}

/// The auth handshake: hostname hint from the header, source IP from the
/// socket, short-lived token out. Rate limiting answers 429 with the
/// window's retry-after.
async fn agent_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let hostname_hint = headers
        .get("x-agent-hostname")
        .and_then(|value| value.to_str().ok());

    match state.auth.issue_token(hostname_hint, addr.ip()) {
        Ok(issued) => (
            StatusCode::OK,
            Json(AgentAuthResponse {
                connection_token: issued.token,
                expires_in: issued.expires_in,
                websocket_endpoint: "/api/agent/connect".to_string(),
            }),
        )
            .into_response(),
        Err(AuthError::RateLimited { retry_after }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedResponse {
                error: "too many authentication attempts".to_string(),
                retry_after,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "authentication failed".to_string(),
                details: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSnapshot>> {
    Json(state.connections.get_active_agents())
}

/// Queues a COMMAND envelope for durable outbound delivery. The processor
/// dispatches it once the host has a live session.
async fn queue_command(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let Ok(host_id) = HostId::parse(&host_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid host id".to_string(),
                details: Some("host id must be a UUID".to_string()),
            }),
        )
            .into_response();
    };
    let Ok(command_type) =
        serde_json::from_value::<CommandType>(Value::String(request.command_type.clone()))
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "unknown command type".to_string(),
                details: Some(request.command_type),
            }),
        )
            .into_response();
    };

    match state.hosts.find_by_id(host_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "host not found".to_string(),
                    details: Some(host_id.to_string()),
                }),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "host lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "host lookup failed".to_string(),
                    details: None,
                }),
            )
                .into_response();
        }
    }

    let envelope = MessageEnvelope::command(
        command_type,
        request.parameters,
        request.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
    );
    let result = state
        .queue
        .enqueue(
            envelope.message_id,
            &envelope.message_type,
            &Value::Object(envelope.data.clone()),
            QueueDirection::Outbound,
            HostRef::Known(host_id),
            QueuePriority::Normal,
        )
        .await;

    match result {
        Ok(message_id) => (
            StatusCode::ACCEPTED,
            Json(CommandQueuedResponse { message_id }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to enqueue command");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to enqueue command".to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

async fn push_config(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Json(config): Json<Value>,
) -> impl IntoResponse {
    let Ok(hostname) = Hostname::try_new(hostname) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid hostname".to_string(),
                details: None,
            }),
        )
            .into_response();
    };
    let success = state
        .config_push
        .push_config_to_agent(&state.connections, &hostname, &config)
        .await;
    (
        StatusCode::OK,
        Json(ConfigPushResponse {
            hostname: hostname.into_inner(),
            success,
        }),
    )
        .into_response()
}

async fn push_config_all(
    State(state): State<AppState>,
    Json(config): Json<Value>,
) -> Json<HashMap<String, bool>> {
    Json(
        state
            .config_push
            .push_config_to_all_agents(&state.connections, &config)
            .await,
    )
}

async fn push_config_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(config): Json<Value>,
) -> Json<PlatformPushResponse> {
    let successful_sends = state
        .config_push
        .push_config_by_platform(&state.connections, &platform, &config)
        .await;
    Json(PlatformPushResponse {
        platform,
        successful_sends,
    })
}

async fn pending_configs(State(state): State<AppState>) -> Json<Vec<PendingConfig>> {
    Json(state.config_push.get_pending_configs())
}

async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.stats().await {
        Ok(stats) => (StatusCode::OK, Json::<QueueStats>(stats)).into_response(),
        Err(e) => {
            error!(error = %e, "queue stats failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "queue stats failed".to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

async fn delete_failed(
    State(state): State<AppState>,
    Json(request): Json<DeleteFailedRequest>,
) -> impl IntoResponse {
    match state.queue.delete_failed_messages(&request.message_ids).await {
        Ok(deleted) => (StatusCode::OK, Json(DeleteFailedResponse { deleted })).into_response(),
        Err(e) => {
            error!(error = %e, "failed-message deletion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "deletion failed".to_string(),
                    details: None,
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::AuthSettings;
    use crate::database::DatabaseConnection;
    use crate::router::LoggingTelemetrySink;

    /// In-memory state with every service wired, for endpoint and frame
    /// handling tests.
    pub(crate) async fn test_state() -> AppState {
        let db = DatabaseConnection::open_in_memory().await.expect("db");
        let pool = db.pool().clone();
        AppState {
            pool: pool.clone(),
            connections: Arc::new(ConnectionManager::new()),
            queue: Arc::new(ServerMessageQueue::new(pool.clone())),
            hosts: Arc::new(HostStore::new(pool)),
            auth: Arc::new(ConnectionAuthenticator::new(AuthSettings::default())),
            config_push: Arc::new(ConfigPushManager::new()),
            telemetry: Arc::new(LoggingTelemetrySink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::test_state;

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let response = health_check().await;
        assert_eq!(response.0.status, "healthy");
    }

    #[tokio::test]
    async fn router_serves_health_without_connection_state() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let state = test_state().await;
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn queue_command_rejects_unknown_command_types() {
        let state = test_state().await;
        let host = state
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();

        let response = queue_command(
            State(state),
            Path(host.id.to_string()),
            Json(CommandRequest {
                command_type: "format_all_disks".to_string(),
                parameters: JsonMap::new(),
                timeout: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn queue_command_persists_an_outbound_row() {
        let state = test_state().await;
        let host = state
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();

        let response = queue_command(
            State(state.clone()),
            Path(host.id.to_string()),
            Json(CommandRequest {
                command_type: "restart_service".to_string(),
                parameters: JsonMap::new(),
                timeout: Some(120),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn queue_command_404s_for_missing_hosts() {
        let state = test_state().await;
        let response = queue_command(
            State(state),
            Path(Uuid::new_v4().to_string()),
            Json(CommandRequest {
                command_type: "get_system_info".to_string(),
                parameters: JsonMap::new(),
                timeout: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

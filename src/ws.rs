//! Agent WebSocket endpoint
//!
//! Accepts the upgrade at `/api/agent/connect?token=...`, authenticates the
//! token against the connecting peer, registers the session, and runs the
//! receive loop. The one invariant that matters for liveness: SYSTEM_INFO
//! and HEARTBEAT are handled inline on the receiving task, everything else
//! is enqueued for the processor. Registration and heartbeats must never
//! wait behind queue latency.
//!
//! A malformed frame gets an ERROR envelope back and the loop continues; the
//! connection only dies when the transport does.

use crate::api::AppState;
use crate::connection_manager::{AgentSocket, SocketError};
use crate::domain_types::AgentId;
use crate::messages::{JsonMap, MessageEnvelope, MessageType, create_message, validate_wire};
use crate::queue::{HostRef, QueueDirection, QueuePriority};
use crate::router::{self, ConnectionInfo, HandlerContext};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Close code: no token supplied with the upgrade
pub const CLOSE_MISSING_TOKEN: u16 = 4000;
/// Close code: token rejected; the reason text names why
pub const CLOSE_INVALID_TOKEN: u16 = 4001;

/// Query parameters of the upgrade request
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// Upgrade handler for `/api/agent/connect`
pub async fn agent_connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.token, addr, state))
}

/// The live WebSocket behind the [`AgentSocket`] seam. Sends are serialized
/// through a mutex because the sink half is shared with broadcast paths.
struct WsTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl AgentSocket for WsTransport {
    async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(classify_send_error)
    }
}

/// The axum transport error is opaque, so classification falls back to the
/// error text: closed channels evict, anything else goes through the
/// connection/network/timeout rule.
fn classify_send_error(e: axum::Error) -> SocketError {
    let text = e.to_string();
    if text.to_lowercase().contains("closed") {
        SocketError::Closed
    } else {
        SocketError::Other(text)
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    token: Option<String>,
    addr: SocketAddr,
    state: AppState,
) {
    let Some(token) = token else {
        close_with(&mut socket, CLOSE_MISSING_TOKEN, "Authentication token required").await;
        return;
    };
    let claims = match state.auth.validate_token(&token, addr.ip()) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(peer = %addr, error = %e, "websocket authentication failed");
            close_with(&mut socket, CLOSE_INVALID_TOKEN, &e.to_string()).await;
            return;
        }
    };
    info!(peer = %addr, hostname_hint = %claims.hostname_hint, "agent websocket authenticated");

    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WsTransport {
        sink: tokio::sync::Mutex::new(sink),
    });
    let agent_id = state.connections.connect(transport.clone());

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                state.connections.touch(agent_id);
                handle_frame(&state, agent_id, transport.as_ref(), text.as_str()).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let host_id = state.connections.host_id(agent_id);
    state.connections.disconnect(agent_id);
    if let Some(host_id) = host_id
        && let Err(e) = state.hosts.mark_down(host_id).await
    {
        error!(%host_id, error = %e, "failed to mark host down on disconnect");
    }
}

/// Processes one received text frame
pub(crate) async fn handle_frame(
    state: &AppState,
    agent_id: AgentId,
    socket: &dyn AgentSocket,
    text: &str,
) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(%agent_id, error = %e, "received malformed JSON frame");
            send_envelope(socket, &MessageEnvelope::error("malformed_json", &e.to_string())).await;
            return;
        }
    };
    if let Err(e) = validate_wire(&raw) {
        warn!(%agent_id, error = %e, "received invalid envelope");
        send_envelope(socket, &MessageEnvelope::error("invalid_message", &e.to_string())).await;
        return;
    }
    let envelope = match create_message(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            send_envelope(socket, &MessageEnvelope::error("invalid_message", &e.to_string())).await;
            return;
        }
    };

    match envelope.kind() {
        Some(MessageType::SystemInfo) => {
            handle_inline_system_info(state, agent_id, socket, &envelope).await;
        }
        Some(MessageType::Heartbeat) => {
            handle_inline_heartbeat(state, agent_id, socket, &envelope).await;
        }
        _ => enqueue_inbound(state, agent_id, &envelope).await,
    }
}

async fn handle_inline_system_info(
    state: &AppState,
    agent_id: AgentId,
    socket: &dyn AgentSocket,
    envelope: &MessageEnvelope,
) {
    let ctx = handler_context(state, agent_id);
    match router::handle_system_info(&ctx, &envelope.data).await {
        Ok(outcome) => {
            let field = |key: &str| envelope.data.get(key).and_then(Value::as_str);
            state.connections.register(
                agent_id,
                &outcome.host.fqdn,
                field("ipv4"),
                field("ipv6"),
                field("platform"),
                outcome.host.id,
            );
            send_envelope(socket, &outcome.response).await;
        }
        Err(e) => {
            warn!(%agent_id, error = %e, "registration failed");
            send_envelope(socket, &MessageEnvelope::error("registration_failed", &e.to_string()))
                .await;
        }
    }
}

async fn handle_inline_heartbeat(
    state: &AppState,
    agent_id: AgentId,
    socket: &dyn AgentSocket,
    envelope: &MessageEnvelope,
) {
    let ctx = handler_context(state, agent_id);
    match router::handle_heartbeat(&ctx, &envelope.data, envelope.message_id).await {
        Ok(ack) => send_envelope(socket, &ack).await,
        Err(e) => {
            warn!(%agent_id, error = %e, "heartbeat rejected");
            send_envelope(socket, &MessageEnvelope::error("heartbeat_failed", &e.to_string()))
                .await;
        }
    }
}

/// Everything that is not inline goes to the durable queue. Sessions that
/// have not registered yet produce rows without a host id; the stored data
/// then carries `_connection_info` so the processor can resolve the host
/// later.
async fn enqueue_inbound(state: &AppState, agent_id: AgentId, envelope: &MessageEnvelope) {
    let host = state
        .connections
        .host_id(agent_id)
        .map_or(HostRef::Unregistered, HostRef::Known);

    let mut stored = envelope.data.clone();
    if host == HostRef::Unregistered {
        let mut info = JsonMap::new();
        info.insert("agent_id".into(), Value::String(agent_id.to_string()));
        if let Some(snapshot) = state.connections.get_agent(agent_id) {
            if let Some(hostname) = snapshot.hostname {
                info.insert("hostname".into(), Value::String(hostname));
            }
            if let Some(ipv4) = snapshot.ipv4 {
                info.insert("ipv4".into(), Value::String(ipv4));
            }
            if let Some(ipv6) = snapshot.ipv6 {
                info.insert("ipv6".into(), Value::String(ipv6));
            }
            if let Some(platform) = snapshot.platform {
                info.insert("platform".into(), Value::String(platform));
            }
        }
        stored.insert("_connection_info".into(), Value::Object(info));
    }

    let result = state
        .queue
        .enqueue(
            envelope.message_id,
            &envelope.message_type,
            &Value::Object(stored),
            QueueDirection::Inbound,
            host,
            inbound_priority(envelope.kind()),
        )
        .await;
    if let Err(e) = result {
        error!(%agent_id, message_id = %envelope.message_id, error = %e, "failed to enqueue inbound message");
    }
}

/// Command results carry operator-visible outcomes; they jump the telemetry
/// backlog.
fn inbound_priority(kind: Option<MessageType>) -> QueuePriority {
    match kind {
        Some(MessageType::CommandResult) => QueuePriority::High,
        _ => QueuePriority::Normal,
    }
}

fn handler_context(state: &AppState, agent_id: AgentId) -> HandlerContext<'_> {
    let connection = state
        .connections
        .get_agent(agent_id)
        .map_or_else(ConnectionInfo::default, |snapshot| ConnectionInfo {
            agent_id: Some(agent_id),
            host_id: snapshot.host_id,
            hostname: snapshot.hostname,
            ipv4: snapshot.ipv4,
            ipv6: snapshot.ipv6,
            platform: snapshot.platform,
        });
    HandlerContext {
        pool: &state.pool,
        hosts: &state.hosts,
        connections: &state.connections,
        config_push: &state.config_push,
        telemetry: state.telemetry.as_ref(),
        connection,
    }
}

async fn send_envelope(socket: &dyn AgentSocket, envelope: &MessageEnvelope) {
    match envelope.to_wire_string() {
        Ok(text) => {
            if let Err(e) = socket.send_text(&text).await {
                warn!(error = %e, "failed to deliver envelope to agent");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize envelope"),
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    // Peer may already be gone; nothing useful to do with the error.
    let _ = socket.send(Message::Close(Some(frame))).await;
}

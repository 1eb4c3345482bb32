//! Live agent session registry
//!
//! Owns every authenticated WebSocket session and the routing primitives over
//! them: send to one agent, to a hostname, to a host id, broadcast to all or
//! by platform. Handler code only ever borrows connections for the duration
//! of a call; the registry is the single owner.
//!
//! Send failures are classified before anything is evicted: transport
//! failures disconnect the agent, protocol failures never do.

use crate::domain_types::{AgentId, HostId};
use crate::hosts::HostStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Transport seam for a single agent session. The WebSocket endpoint plugs
/// in the real sink; tests plug in fakes.
#[async_trait]
pub trait AgentSocket: Send + Sync {
    /// Sends one text frame to the agent
    async fn send_text(&self, text: &str) -> Result<(), SocketError>;
}

/// Classified transport errors from [`AgentSocket::send_text`]
#[derive(Debug, Error)]
pub enum SocketError {
    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,

    /// OS or network level I/O failure
    #[error("transport I/O error: {0}")]
    Io(String),

    /// Message could not be framed; the connection itself is fine
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unclassified failure; eviction decided by message text
    #[error("{0}")]
    Other(String),
}

impl SocketError {
    /// Whether this failure means the connection is gone. Unknown errors are
    /// kept unless they look like a connection problem.
    #[must_use]
    pub fn warrants_eviction(&self) -> bool {
        match self {
            Self::Closed | Self::Io(_) => true,
            Self::Protocol(_) => false,
            Self::Other(message) => {
                let lower = message.to_lowercase();
                lower.contains("connection")
                    || lower.contains("network")
                    || lower.contains("timeout")
            }
        }
    }
}

/// One live agent session
pub struct AgentConnection {
    pub agent_id: AgentId,
    socket: Arc<dyn AgentSocket>,
    pub hostname: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub host_id: Option<HostId>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pending_commands: Vec<Uuid>,
}

/// Serializable view of a live session for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub host_id: Option<HostId>,
    pub hostname: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentConnection {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id,
            host_id: self.host_id,
            hostname: self.hostname.clone(),
            ipv4: self.ipv4.clone(),
            ipv6: self.ipv6.clone(),
            platform: self.platform.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
        }
    }
}

/// Registry of all active agent sessions
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<AgentId, AgentConnection>,
    /// hostname (as registered) -> agent id, for direct routing
    hostname_index: DashMap<String, AgentId>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a new session and assigns it an agent id
    pub fn connect(&self, socket: Arc<dyn AgentSocket>) -> AgentId {
        let agent_id = AgentId::generate();
        let now = Utc::now();
        self.connections.insert(
            agent_id,
            AgentConnection {
                agent_id,
                socket,
                hostname: None,
                ipv4: None,
                ipv6: None,
                platform: None,
                host_id: None,
                connected_at: now,
                last_seen: now,
                pending_commands: Vec::new(),
            },
        );
        info!(%agent_id, "agent connected");
        agent_id
    }

    /// Binds descriptive attributes after registration and indexes the
    /// hostname for lookups. Returns `false` for unknown sessions.
    pub fn register(
        &self,
        agent_id: AgentId,
        hostname: &str,
        ipv4: Option<&str>,
        ipv6: Option<&str>,
        platform: Option<&str>,
        host_id: HostId,
    ) -> bool {
        let Some(mut connection) = self.connections.get_mut(&agent_id) else {
            return false;
        };
        if let Some(previous) = connection.hostname.take()
            && previous != hostname
        {
            self.hostname_index
                .remove_if(&previous, |_, id| *id == agent_id);
        }
        connection.hostname = Some(hostname.to_string());
        if let Some(ipv4) = ipv4 {
            connection.ipv4 = Some(ipv4.to_string());
        }
        if let Some(ipv6) = ipv6 {
            connection.ipv6 = Some(ipv6.to_string());
        }
        if let Some(platform) = platform {
            connection.platform = Some(platform.to_string());
        }
        connection.host_id = Some(host_id);
        connection.last_seen = Utc::now();
        drop(connection);

        // A reconnecting host takes over its hostname slot; stale sessions
        // lose their index entry and are reachable only by agent id.
        self.hostname_index.insert(hostname.to_string(), agent_id);
        info!(%agent_id, hostname, "agent registered");
        true
    }

    /// Removes a session; idempotent
    pub fn disconnect(&self, agent_id: AgentId) {
        if let Some((_, connection)) = self.connections.remove(&agent_id) {
            if let Some(hostname) = &connection.hostname {
                self.hostname_index
                    .remove_if(hostname, |_, id| *id == agent_id);
            }
            info!(%agent_id, hostname = ?connection.hostname, "agent disconnected");
        }
    }

    /// Updates the liveness timestamp for a session
    pub fn touch(&self, agent_id: AgentId) {
        if let Some(mut connection) = self.connections.get_mut(&agent_id) {
            connection.last_seen = Utc::now();
        }
    }

    /// The host bound to a session, once registered
    #[must_use]
    pub fn host_id(&self, agent_id: AgentId) -> Option<HostId> {
        self.connections.get(&agent_id).and_then(|c| c.host_id)
    }

    /// Records an outbound command awaiting its COMMAND_RESULT
    pub fn note_pending_command(&self, agent_id: AgentId, command_id: Uuid) {
        if let Some(mut connection) = self.connections.get_mut(&agent_id) {
            connection.pending_commands.push(command_id);
        }
    }

    /// Correlates a COMMAND_RESULT with the session that owns the command.
    /// Returns `false` when no live session holds `command_id`.
    pub fn complete_pending_command(&self, hostname: &str, command_id: Uuid) -> bool {
        let Some(agent_id) = self.resolve_hostname(hostname) else {
            return false;
        };
        let Some(mut connection) = self.connections.get_mut(&agent_id) else {
            return false;
        };
        let before = connection.pending_commands.len();
        connection.pending_commands.retain(|id| *id != command_id);
        before != connection.pending_commands.len()
    }

    /// Sends to a specific session. `true` also covers protocol failures,
    /// which keep the connection alive by design of the error taxonomy.
    pub async fn send_to_agent(&self, agent_id: AgentId, message: &Value) -> bool {
        let Some((socket, hostname)) = self.socket_for(agent_id) else {
            return false;
        };
        Self::send_on(socket.as_ref(), hostname.as_deref(), message).await
    }

    /// Sends to the session registered under `hostname`; exact match first,
    /// then case-insensitive.
    pub async fn send_to_hostname(&self, hostname: &str, message: &Value) -> bool {
        match self.resolve_hostname(hostname) {
            Some(agent_id) => self.send_to_agent(agent_id, message).await,
            None => {
                warn!(hostname, "no agent registered for hostname");
                false
            }
        }
    }

    /// Sends to the agent of a persisted host, resolving its fqdn first
    pub async fn send_to_host(&self, hosts: &HostStore, host_id: HostId, message: &Value) -> bool {
        match hosts.find_by_id(host_id).await {
            Ok(Some(host)) => self.send_to_hostname(&host.fqdn, message).await,
            Ok(None) => false,
            Err(e) => {
                error!(%host_id, error = %e, "host lookup failed during send");
                false
            }
        }
    }

    /// Broadcasts to every session. Failed sends evict their connection;
    /// returns the number of successful sends.
    pub async fn broadcast_to_all(&self, message: &Value) -> usize {
        self.broadcast_filtered(message, |_| true).await
    }

    /// Broadcasts to sessions of one platform
    pub async fn broadcast_to_platform(&self, platform: &str, message: &Value) -> usize {
        self.broadcast_filtered(message, |connection| {
            connection.platform.as_deref() == Some(platform)
        })
        .await
    }

    /// Snapshots of all live sessions
    #[must_use]
    pub fn get_active_agents(&self) -> Vec<AgentSnapshot> {
        self.connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Snapshot of one session by agent id
    #[must_use]
    pub fn get_agent(&self, agent_id: AgentId) -> Option<AgentSnapshot> {
        self.connections.get(&agent_id).map(|c| c.snapshot())
    }

    /// Snapshot of the session registered under `hostname`
    #[must_use]
    pub fn get_agent_by_hostname(&self, hostname: &str) -> Option<AgentSnapshot> {
        let agent_id = self.resolve_hostname(hostname)?;
        self.connections.get(&agent_id).map(|c| c.snapshot())
    }

    fn resolve_hostname(&self, hostname: &str) -> Option<AgentId> {
        if let Some(agent_id) = self.hostname_index.get(hostname) {
            return Some(*agent_id);
        }
        let lower = hostname.to_lowercase();
        self.hostname_index
            .iter()
            .find(|entry| entry.key().to_lowercase() == lower)
            .map(|entry| *entry.value())
    }

    fn socket_for(&self, agent_id: AgentId) -> Option<(Arc<dyn AgentSocket>, Option<String>)> {
        self.connections
            .get(&agent_id)
            .map(|c| (Arc::clone(&c.socket), c.hostname.clone()))
    }

    /// Two-pass broadcast: snapshot targets without touching the registry,
    /// send, then evict the failures. Avoids mutating the map mid-iteration.
    async fn broadcast_filtered<F>(&self, message: &Value, filter: F) -> usize
    where
        F: Fn(&AgentConnection) -> bool,
    {
        let targets: Vec<(AgentId, Arc<dyn AgentSocket>, Option<String>)> = self
            .connections
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| {
                (
                    entry.value().agent_id,
                    Arc::clone(&entry.value().socket),
                    entry.value().hostname.clone(),
                )
            })
            .collect();

        let mut successful = 0;
        let mut failed = Vec::new();
        for (agent_id, socket, hostname) in targets {
            if Self::send_on(socket.as_ref(), hostname.as_deref(), message).await {
                successful += 1;
            } else {
                failed.push(agent_id);
            }
        }
        for agent_id in failed {
            self.disconnect(agent_id);
        }
        successful
    }

    async fn send_on(socket: &dyn AgentSocket, hostname: Option<&str>, message: &Value) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                // Serialization problems are ours, not the agent's.
                warn!(hostname, error = %e, "message serialization failed, connection stays active");
                return true;
            }
        };
        match socket.send_text(&text).await {
            Ok(()) => true,
            Err(e) if e.warrants_eviction() => {
                error!(hostname, error = %e, "communication error sending to agent");
                false
            }
            Err(e) => {
                warn!(hostname, error = %e, "protocol error sending to agent, connection stays active");
                true
            }
        }
    }
}

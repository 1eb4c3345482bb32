//! Inbound message routing
//!
//! A closed dispatch table from [`MessageType`] to a typed handler. Three
//! handlers are part of the core contract (SYSTEM_INFO registration,
//! HEARTBEAT liveness, COMMAND_RESULT correlation); the telemetry family is
//! opaque to the core and delegated to a [`TelemetrySink`] the composition
//! root supplies. Unknown types are reported, not fatal, and a handler
//! failure never propagates to the connection.
//!
//! Handlers receive their collaborators explicitly through
//! [`HandlerContext`]; nothing in this module reaches for globals.

use crate::config_push::ConfigPushManager;
use crate::connection_manager::ConnectionManager;
use crate::domain_types::{AgentId, HostId};
use crate::hosts::{HostRecord, HostStore, HostStoreError};
use crate::messages::{JsonMap, MessageEnvelope, MessageType};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of routing one inbound message
#[derive(Debug)]
pub enum RouteOutcome {
    /// A handler accepted the message
    Handled,
    /// No handler exists for this message type
    Unknown,
    /// A handler rejected the message; the reason lands on the queue entry
    Failed(String),
}

/// Errors surfaced by the contract handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("missing {0} in message data")]
    MissingField(&'static str),

    #[error("host {0} is not registered")]
    UnknownHost(String),

    #[error(transparent)]
    Host(#[from] HostStoreError),
}

/// Errors from external telemetry handlers; recorded on the queue entry
pub type TelemetryError = Box<dyn std::error::Error + Send + Sync>;

/// The shape handlers see for "who sent this". Live WebSocket sessions and
/// queued-entry stubs produce the same shape, so handlers cannot tell the
/// difference.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub agent_id: Option<AgentId>,
    pub host_id: Option<HostId>,
    pub hostname: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub platform: Option<String>,
}

impl ConnectionInfo {
    /// Stub connection for a queued entry with a validated host
    #[must_use]
    pub fn for_host(host: &HostRecord) -> Self {
        Self {
            host_id: Some(host.id),
            hostname: Some(host.fqdn.clone()),
            ..Self::default()
        }
    }

    /// Stub connection rebuilt from the `_connection_info` a pre-registration
    /// entry carried
    #[must_use]
    pub fn from_connection_info(info: &JsonMap) -> Self {
        let text = |key: &str| info.get(key).and_then(Value::as_str).map(String::from);
        Self {
            agent_id: None,
            host_id: None,
            hostname: text("hostname"),
            ipv4: text("ipv4"),
            ipv6: text("ipv6"),
            platform: text("platform"),
        }
    }
}

/// External ingestion of business telemetry. The core routes payloads here
/// and records failures; it never interprets them. Default implementations
/// log a payload summary and accept, which is the behavior of a server with
/// no telemetry pipeline attached.
#[async_trait]
#[allow(unused_variables)]
pub trait TelemetrySink: Send + Sync {
    async fn on_os_version_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_hardware_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_user_access_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_software_inventory_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_package_updates_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_packages_batch_start(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_packages_batch(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_packages_batch_end(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_script_execution_result(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_reboot_status_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_host_certificates_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_role_data(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_third_party_repository_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_antivirus_status_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_commercial_antivirus_status_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_update_apply_result(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_diagnostic_collection_result(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_firewall_status_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_graylog_status_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_hostname_changed(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_virtualization_support_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_child_host_list_update(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_child_host_creation_progress(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn on_child_host_created(
        &self,
        pool: &SqlitePool,
        connection: &ConnectionInfo,
        data: &JsonMap,
    ) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// The do-nothing sink used when no telemetry pipeline is wired in
pub struct LoggingTelemetrySink;

#[async_trait]
impl TelemetrySink for LoggingTelemetrySink {}

/// Everything a handler is allowed to touch, passed explicitly
pub struct HandlerContext<'a> {
    pub pool: &'a SqlitePool,
    pub hosts: &'a HostStore,
    pub connections: &'a ConnectionManager,
    pub config_push: &'a ConfigPushManager,
    pub telemetry: &'a dyn TelemetrySink,
    pub connection: ConnectionInfo,
}

/// Result of processing a SYSTEM_INFO registration
pub struct RegistrationOutcome {
    pub host: HostRecord,
    /// Acknowledgment the caller delivers to the live socket, if any
    pub response: MessageEnvelope,
}

/// SYSTEM_INFO: create or update the host for the reported hostname. New
/// hosts start pending; an approved host stays approved.
///
/// # Errors
///
/// Returns an error when no hostname can be determined or the store fails.
pub async fn handle_system_info(
    ctx: &HandlerContext<'_>,
    data: &JsonMap,
) -> Result<RegistrationOutcome, HandlerError> {
    let hostname = data
        .get("hostname")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or(ctx.connection.hostname.as_deref())
        .ok_or(HandlerError::MissingField("hostname"))?;

    let field = |key: &str| data.get(key).and_then(Value::as_str);
    let host = ctx
        .hosts
        .register(hostname, field("ipv4"), field("ipv6"), field("platform"))
        .await?;

    info!(
        hostname,
        host_id = %host.id,
        approval = host.approval_status.as_str(),
        "agent registration processed"
    );
    let response = MessageEnvelope::registration_ack(
        &host.id.to_string(),
        host.approval_status.as_str(),
        &host.fqdn,
    );
    Ok(RegistrationOutcome { host, response })
}

/// HEARTBEAT: mark the host up and acknowledge with an envelope keyed on
/// the heartbeat's own message id, so duplicate heartbeats ack idempotently.
///
/// # Errors
///
/// Returns an error when the sender cannot be resolved to a host.
pub async fn handle_heartbeat(
    ctx: &HandlerContext<'_>,
    data: &JsonMap,
    heartbeat_id: Uuid,
) -> Result<MessageEnvelope, HandlerError> {
    let host_id = match ctx.connection.host_id {
        Some(id) => id,
        None => {
            let hostname = ctx
                .connection
                .hostname
                .as_deref()
                .or_else(|| data.get("hostname").and_then(Value::as_str))
                .ok_or(HandlerError::MissingField("hostname"))?;
            ctx.hosts
                .find_by_fqdn(hostname)
                .await?
                .ok_or_else(|| HandlerError::UnknownHost(hostname.to_string()))?
                .id
        }
    };

    ctx.hosts.record_heartbeat(host_id).await?;
    Ok(MessageEnvelope::heartbeat_ack(heartbeat_id))
}

/// COMMAND_RESULT: correlate by `command_id`. Clears the live session's
/// pending command slot when one exists, and forwards configuration
/// acknowledgments to the config push manager. No host lookup.
///
/// # Errors
///
/// Returns an error when `command_id` is missing or malformed.
pub fn handle_command_result(ctx: &HandlerContext<'_>, data: &JsonMap) -> Result<(), HandlerError> {
    let command_id = data
        .get("command_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(HandlerError::MissingField("command_id"))?;
    let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
    let error_text = data.get("error").and_then(Value::as_str);

    info!(%command_id, success, "command result received");

    if let Some(hostname) = ctx.connection.hostname.as_deref() {
        ctx.connections.complete_pending_command(hostname, command_id);

        if let Some(pending_version) = ctx.config_push.ack_version_for(hostname, command_id) {
            let version = data
                .get("version")
                .and_then(Value::as_u64)
                .unwrap_or(pending_version);
            ctx.config_push
                .handle_config_acknowledgment(hostname, version, success, error_text);
        }
    }
    Ok(())
}

/// Routes one inbound message to its handler. Telemetry payloads go to the
/// sink; handler failures are captured, never propagated.
pub async fn route_inbound(
    ctx: &HandlerContext<'_>,
    message_type: &str,
    message_id: Uuid,
    data: &JsonMap,
) -> RouteOutcome {
    let Some(kind) = MessageType::from_tag(message_type) else {
        warn!(message_type, "unknown message type in queue");
        return RouteOutcome::Unknown;
    };

    log_payload_summary(kind, data);

    let telemetry_result = match kind {
        MessageType::SystemInfo => {
            return match handle_system_info(ctx, data).await {
                Ok(_) => RouteOutcome::Handled,
                Err(e) => RouteOutcome::Failed(e.to_string()),
            };
        }
        MessageType::Heartbeat => {
            // Heartbeats are inline sideband; a queued one still refreshes
            // liveness, the ack simply has no socket to go to.
            return match handle_heartbeat(ctx, data, message_id).await {
                Ok(_) => RouteOutcome::Handled,
                Err(e) => RouteOutcome::Failed(e.to_string()),
            };
        }
        MessageType::CommandResult => {
            return match handle_command_result(ctx, data) {
                Ok(()) => RouteOutcome::Handled,
                Err(e) => RouteOutcome::Failed(e.to_string()),
            };
        }
        MessageType::OsVersionUpdate => {
            ctx.telemetry
                .on_os_version_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::HardwareUpdate => {
            ctx.telemetry
                .on_hardware_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::UserAccessUpdate => {
            ctx.telemetry
                .on_user_access_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::SoftwareInventoryUpdate => {
            ctx.telemetry
                .on_software_inventory_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::PackageUpdatesUpdate => {
            ctx.telemetry
                .on_package_updates_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::AvailablePackagesBatchStart => {
            ctx.telemetry
                .on_packages_batch_start(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::AvailablePackagesBatch => {
            ctx.telemetry
                .on_packages_batch(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::AvailablePackagesBatchEnd => {
            ctx.telemetry
                .on_packages_batch_end(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::ScriptExecutionResult => {
            ctx.telemetry
                .on_script_execution_result(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::RebootStatusUpdate => {
            ctx.telemetry
                .on_reboot_status_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::HostCertificatesUpdate => {
            ctx.telemetry
                .on_host_certificates_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::RoleData => {
            ctx.telemetry
                .on_role_data(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::ThirdPartyRepositoryUpdate => {
            ctx.telemetry
                .on_third_party_repository_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::AntivirusStatusUpdate => {
            ctx.telemetry
                .on_antivirus_status_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::CommercialAntivirusStatusUpdate => {
            ctx.telemetry
                .on_commercial_antivirus_status_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::UpdateApplyResult => {
            ctx.telemetry
                .on_update_apply_result(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::DiagnosticCollectionResult => {
            ctx.telemetry
                .on_diagnostic_collection_result(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::FirewallStatusUpdate => {
            ctx.telemetry
                .on_firewall_status_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::GraylogStatusUpdate => {
            ctx.telemetry
                .on_graylog_status_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::HostnameChanged => {
            ctx.telemetry
                .on_hostname_changed(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::VirtualizationSupportUpdate => {
            ctx.telemetry
                .on_virtualization_support_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::ChildHostListUpdate => {
            ctx.telemetry
                .on_child_host_list_update(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::ChildHostCreationProgress => {
            ctx.telemetry
                .on_child_host_creation_progress(ctx.pool, &ctx.connection, data)
                .await
        }
        MessageType::ChildHostCreated => {
            ctx.telemetry
                .on_child_host_created(ctx.pool, &ctx.connection, data)
                .await
        }
        _ => {
            warn!(message_type, "unroutable message type in queue");
            return RouteOutcome::Unknown;
        }
    };

    match telemetry_result {
        Ok(()) => RouteOutcome::Handled,
        Err(e) => RouteOutcome::Failed(e.to_string()),
    }
}

/// Logs the interesting slice of well-known payloads before dispatch
pub(crate) fn log_payload_summary(kind: MessageType, data: &JsonMap) {
    match kind {
        MessageType::HardwareUpdate => {
            info!(
                cpu_vendor = data.get("cpu_vendor").and_then(serde_json::Value::as_str).unwrap_or("N/A"),
                cpu_model = data.get("cpu_model").and_then(serde_json::Value::as_str).unwrap_or("N/A"),
                memory_total_mb = data.get("memory_total_mb").and_then(serde_json::Value::as_i64),
                "hardware data received"
            );
        }
        MessageType::SoftwareInventoryUpdate => {
            info!(
                total_packages = data.get("total_packages").and_then(serde_json::Value::as_i64),
                "software inventory received"
            );
        }
        MessageType::UserAccessUpdate => {
            info!(
                total_users = data.get("total_users").and_then(serde_json::Value::as_i64),
                total_groups = data.get("total_groups").and_then(serde_json::Value::as_i64),
                "user access data received"
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::hosts::ApprovalStatus;
    use serde_json::json;

    struct Fixture {
        pool: SqlitePool,
        hosts: HostStore,
        connections: ConnectionManager,
        config_push: ConfigPushManager,
        telemetry: LoggingTelemetrySink,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = DatabaseConnection::open_in_memory().await.expect("db");
            Self {
                pool: db.pool().clone(),
                hosts: HostStore::new(db.pool().clone()),
                connections: ConnectionManager::new(),
                config_push: ConfigPushManager::new(),
                telemetry: LoggingTelemetrySink,
            }
        }

        fn ctx(&self, connection: ConnectionInfo) -> HandlerContext<'_> {
            HandlerContext {
                pool: &self.pool,
                hosts: &self.hosts,
                connections: &self.connections,
                config_push: &self.config_push,
                telemetry: &self.telemetry,
                connection,
            }
        }
    }

    fn data(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn system_info_registers_a_pending_host_and_acks() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx(ConnectionInfo::default());
        let outcome = handle_system_info(
            &ctx,
            &data(json!({"hostname": "node-1.example.com", "ipv4": "10.0.0.1", "platform": "Linux"})),
        )
        .await
        .expect("registration");

        assert_eq!(outcome.host.approval_status, ApprovalStatus::Pending);
        assert_eq!(outcome.response.data["status"], json!("registered"));
        assert_eq!(outcome.response.data["approval_status"], json!("pending"));

        let stored = fixture
            .hosts
            .find_by_fqdn("node-1.example.com")
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn system_info_without_hostname_fails() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx(ConnectionInfo::default());
        let result = handle_system_info(&ctx, &data(json!({"ipv4": "10.0.0.1"}))).await;
        assert!(matches!(result, Err(HandlerError::MissingField("hostname"))));
    }

    #[tokio::test]
    async fn heartbeat_acks_with_the_heartbeat_id_and_marks_host_up() {
        let fixture = Fixture::new().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        fixture.hosts.mark_down(host.id).await.unwrap();

        let ctx = fixture.ctx(ConnectionInfo {
            host_id: Some(host.id),
            hostname: Some(host.fqdn.clone()),
            ..ConnectionInfo::default()
        });
        let heartbeat_id = Uuid::parse_str("11111111-1111-4111-8111-111111111111").unwrap();
        let ack = handle_heartbeat(&ctx, &data(json!({"agent_status": "healthy"})), heartbeat_id)
            .await
            .expect("ack");

        assert_eq!(ack.message_id, heartbeat_id);
        assert_eq!(ack.data["status"], json!("heartbeat_received"));

        let reloaded = fixture.hosts.find_by_id(host.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, "up");
        assert!(reloaded.active);
        assert!(reloaded.last_access.is_some());
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_sender_fails() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx(ConnectionInfo::default());
        let result = handle_heartbeat(&ctx, &data(json!({"hostname": "ghost"})), Uuid::new_v4()).await;
        assert!(matches!(result, Err(HandlerError::UnknownHost(_))));
    }

    #[tokio::test]
    async fn unknown_message_type_is_reported_not_fatal() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx(ConnectionInfo::default());
        let outcome = route_inbound(&ctx, "quantum_status_update", Uuid::new_v4(), &JsonMap::new()).await;
        assert!(matches!(outcome, RouteOutcome::Unknown));

        // In the closed set but with no inbound handler: also Unknown.
        let outcome = route_inbound(&ctx, "ping", Uuid::new_v4(), &JsonMap::new()).await;
        assert!(matches!(outcome, RouteOutcome::Unknown));
    }

    #[tokio::test]
    async fn telemetry_payloads_route_to_the_sink() {
        let fixture = Fixture::new().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        let ctx = fixture.ctx(ConnectionInfo::for_host(&host));
        let outcome = route_inbound(
            &ctx,
            "hardware_update",
            Uuid::new_v4(),
            &data(json!({"cpu_vendor": "GenuineIntel", "cpu_model": "i7", "memory_total_mb": 32768})),
        )
        .await;
        assert!(matches!(outcome, RouteOutcome::Handled));
    }

    #[tokio::test]
    async fn telemetry_failures_are_captured() {
        struct FailingSink;

        #[async_trait]
        impl TelemetrySink for FailingSink {
            async fn on_hardware_update(
                &self,
                _pool: &SqlitePool,
                _connection: &ConnectionInfo,
                _data: &JsonMap,
            ) -> Result<(), TelemetryError> {
                Err("hardware parser rejected payload".into())
            }
        }

        let fixture = Fixture::new().await;
        let sink = FailingSink;
        let ctx = HandlerContext {
            pool: &fixture.pool,
            hosts: &fixture.hosts,
            connections: &fixture.connections,
            config_push: &fixture.config_push,
            telemetry: &sink,
            connection: ConnectionInfo::default(),
        };
        let outcome = route_inbound(&ctx, "hardware_update", Uuid::new_v4(), &JsonMap::new()).await;
        match outcome {
            RouteOutcome::Failed(reason) => {
                assert!(reason.contains("hardware parser rejected payload"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_result_requires_a_command_id() {
        let fixture = Fixture::new().await;
        let ctx = fixture.ctx(ConnectionInfo::default());
        let result = handle_command_result(&ctx, &data(json!({"success": true})));
        assert!(matches!(result, Err(HandlerError::MissingField("command_id"))));
    }

    #[tokio::test]
    async fn command_result_forwards_config_acknowledgment() {
        use crate::connection_manager::tests::FakeSocket;

        let fixture = Fixture::new().await;
        let agent_id = fixture.connections.connect(FakeSocket::healthy());
        fixture.connections.register(
            agent_id,
            "node-1.example.com",
            None,
            None,
            Some("Linux"),
            HostId::generate(),
        );
        assert!(
            fixture
                .config_push
                .push_config_to_agent(&fixture.connections, "node-1.example.com", &json!({"k": 1}))
                .await
        );
        let pending = fixture.config_push.get_pending_configs();
        let envelope_id = pending[0].envelope_id;

        let ctx = fixture.ctx(ConnectionInfo {
            hostname: Some("node-1.example.com".to_string()),
            ..ConnectionInfo::default()
        });
        handle_command_result(
            &ctx,
            &data(json!({"command_id": envelope_id.to_string(), "success": true})),
        )
        .expect("command result");

        assert!(fixture.config_push.get_pending_configs().is_empty());
    }
}

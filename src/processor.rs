//! Queue processing workers
//!
//! The inbound processor drains the durable queue on a schedule: each tick
//! expires old rows, rescues stuck claims, then works through hosts with
//! pending messages in queue order. Messages for one host are processed
//! sequentially; distinct hosts may be processed by parallel workers, which
//! is safe because every row is claimed atomically before it is touched.
//!
//! The outbound pass delivers queued server-to-agent messages to live
//! sessions; rows for disconnected hosts stay PENDING until the agent
//! reconnects.

use crate::config::AppConfig;
use crate::config_push::ConfigPushManager;
use crate::connection_manager::ConnectionManager;
use crate::hosts::{ApprovalStatus, HostRecord, HostStore, HostStoreError};
use crate::messages::MessageType;
use crate::queue::{
    QueueDirection, QueueEntry, QueueError, ServerMessageQueue,
};
use crate::router::{
    self, ConnectionInfo, HandlerContext, RouteOutcome, TelemetrySink,
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Errors that abort a whole processor tick. Per-message failures never
/// surface here; they land on the queue entry instead.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Host(#[from] HostStoreError),
}

/// Settings one processor instance runs with
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub stuck_in_progress_seconds: u64,
    pub host_batch_size: u32,
    pub expiration_timeout_minutes: u64,
    pub poll_interval: Duration,
}

impl ProcessorConfig {
    #[must_use]
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            stuck_in_progress_seconds: config.processor.stuck_in_progress_seconds,
            host_batch_size: config.processor.host_batch_size,
            expiration_timeout_minutes: config.message_queue.expiration_timeout_minutes,
            poll_interval: Duration::from_secs(config.processor.poll_interval_seconds),
        }
    }
}

/// The periodic queue worker
pub struct InboundProcessor {
    pool: SqlitePool,
    queue: ServerMessageQueue,
    hosts: HostStore,
    connections: Arc<ConnectionManager>,
    config_push: Arc<ConfigPushManager>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ProcessorConfig,
}

impl InboundProcessor {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        queue: ServerMessageQueue,
        hosts: HostStore,
        connections: Arc<ConnectionManager>,
        config_push: Arc<ConfigPushManager>,
        telemetry: Arc<dyn TelemetrySink>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            hosts,
            connections,
            config_push,
            telemetry,
            config,
        }
    }

    /// Runs ticks forever on the configured interval
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "processor tick failed");
            }
        }
    }

    /// One full processing tick
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (database down);
    /// individual message failures are recorded on their queue entries.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<(), ProcessorError> {
        self.queue
            .expire_old_messages(self.config.expiration_timeout_minutes)
            .await?;
        self.queue
            .reset_stuck_messages(self.config.stuck_in_progress_seconds)
            .await?;

        self.process_inbound_for_known_hosts().await?;
        self.process_inbound_unregistered().await?;
        self.dispatch_outbound().await?;
        Ok(())
    }

    async fn process_inbound_for_known_hosts(&self) -> Result<(), ProcessorError> {
        let host_ids = self
            .queue
            .hosts_with_pending(QueueDirection::Inbound, self.config.host_batch_size)
            .await?;
        for host_id in host_ids {
            let Some(host) = self.hosts.find_by_id(host_id).await? else {
                warn!(%host_id, "host no longer exists, deleting its queued messages");
                self.queue.delete_messages_for_host(host_id).await?;
                continue;
            };
            if host.approval_status != ApprovalStatus::Approved {
                warn!(
                    %host_id,
                    fqdn = %host.fqdn,
                    approval = host.approval_status.as_str(),
                    "host not approved, deleting its queued messages"
                );
                self.queue.delete_messages_for_host(host_id).await?;
                continue;
            }

            let entries = self
                .queue
                .dequeue_for_host(host_id, QueueDirection::Inbound, self.config.host_batch_size)
                .await?;
            for entry in entries {
                self.process_validated_message(&entry, &host).await?;
            }
        }
        Ok(())
    }

    async fn process_inbound_unregistered(&self) -> Result<(), ProcessorError> {
        let entries = self
            .queue
            .pending_unregistered(self.config.host_batch_size)
            .await?;
        for entry in entries {
            if entry.message_type == MessageType::SystemInfo.as_tag() {
                self.process_system_info_message(&entry).await?;
                continue;
            }

            let data = match ServerMessageQueue::deserialize_message_data(&entry) {
                Ok(data) => data,
                Err(e) => {
                    self.queue
                        .mark_failed(entry.message_id, &format!("Processing error: {e}"))
                        .await?;
                    continue;
                }
            };
            let hostname = data
                .get("hostname")
                .and_then(Value::as_str)
                .or_else(|| {
                    data.get("_connection_info")
                        .and_then(|info| info.get("hostname"))
                        .and_then(Value::as_str)
                })
                .map(ToString::to_string);

            let Some(hostname) = hostname else {
                warn!(message_id = %entry.message_id, "queued message missing hostname");
                self.queue
                    .mark_failed(entry.message_id, "Missing hostname in message data")
                    .await?;
                continue;
            };
            let Some(host) = self.hosts.find_by_fqdn(&hostname).await? else {
                self.queue
                    .mark_failed(entry.message_id, &format!("Host {hostname} not found"))
                    .await?;
                continue;
            };
            if host.approval_status != ApprovalStatus::Approved {
                self.queue
                    .mark_failed(entry.message_id, &format!("Host {hostname} not approved"))
                    .await?;
                continue;
            }
            self.process_validated_message(&entry, &host).await?;
        }
        Ok(())
    }

    /// Processes one claimed entry for a validated host. The handler sees a
    /// stub connection carrying the host's id and fqdn, exactly the shape a
    /// live session presents.
    async fn process_validated_message(
        &self,
        entry: &QueueEntry,
        host: &HostRecord,
    ) -> Result<(), ProcessorError> {
        if !self.queue.mark_processing(entry.message_id).await? {
            // Another worker owns this row.
            return Ok(());
        }

        let data = match ServerMessageQueue::deserialize_message_data(entry) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                self.queue
                    .mark_failed(entry.message_id, "Message data is not an object")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.queue
                    .mark_failed(entry.message_id, &format!("Processing error: {e}"))
                    .await?;
                return Ok(());
            }
        };

        let ctx = HandlerContext {
            pool: &self.pool,
            hosts: &self.hosts,
            connections: &self.connections,
            config_push: &self.config_push,
            telemetry: self.telemetry.as_ref(),
            connection: ConnectionInfo::for_host(host),
        };
        match router::route_inbound(&ctx, &entry.message_type, entry.message_id, &data).await {
            RouteOutcome::Handled => {
                self.queue.mark_completed(entry.message_id).await?;
                info!(
                    message_id = %entry.message_id,
                    fqdn = %host.fqdn,
                    "queued message processed"
                );
            }
            RouteOutcome::Unknown => {
                self.queue
                    .mark_failed(entry.message_id, "Unknown message type")
                    .await?;
            }
            RouteOutcome::Failed(reason) => {
                self.queue.mark_failed(entry.message_id, &reason).await?;
            }
        }
        Ok(())
    }

    /// Registration entries run without host validation: the handler itself
    /// creates or updates the host record.
    async fn process_system_info_message(&self, entry: &QueueEntry) -> Result<(), ProcessorError> {
        if !self.queue.mark_processing(entry.message_id).await? {
            return Ok(());
        }

        let data = match ServerMessageQueue::deserialize_message_data(entry) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                self.queue
                    .mark_failed(entry.message_id, "Message data is not an object")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.queue
                    .mark_failed(entry.message_id, &format!("Processing error: {e}"))
                    .await?;
                return Ok(());
            }
        };

        let connection = data
            .get("_connection_info")
            .and_then(Value::as_object)
            .map(ConnectionInfo::from_connection_info)
            .unwrap_or_default();
        let ctx = HandlerContext {
            pool: &self.pool,
            hosts: &self.hosts,
            connections: &self.connections,
            config_push: &self.config_push,
            telemetry: self.telemetry.as_ref(),
            connection,
        };
        match router::handle_system_info(&ctx, &data).await {
            Ok(outcome) => {
                self.queue.mark_completed(entry.message_id).await?;
                info!(
                    message_id = %entry.message_id,
                    fqdn = %outcome.host.fqdn,
                    "queued registration processed"
                );
            }
            Err(e) => {
                self.queue
                    .mark_failed(entry.message_id, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// Delivers queued outbound messages to connected hosts. Hosts without a
    /// live session are skipped; their rows stay PENDING until reconnect.
    async fn dispatch_outbound(&self) -> Result<(), ProcessorError> {
        let host_ids = self
            .queue
            .hosts_with_pending(QueueDirection::Outbound, self.config.host_batch_size)
            .await?;
        for host_id in host_ids {
            let Some(host) = self.hosts.find_by_id(host_id).await? else {
                self.queue.delete_messages_for_host(host_id).await?;
                continue;
            };
            let Some(agent) = self.connections.get_agent_by_hostname(&host.fqdn) else {
                continue;
            };

            let entries = self
                .queue
                .dequeue_for_host(host_id, QueueDirection::Outbound, self.config.host_batch_size)
                .await?;
            for entry in entries {
                if !self.queue.mark_processing(entry.message_id).await? {
                    continue;
                }
                let data = match ServerMessageQueue::deserialize_message_data(&entry) {
                    Ok(data) => data,
                    Err(e) => {
                        self.queue
                            .mark_failed(entry.message_id, &format!("Processing error: {e}"))
                            .await?;
                        continue;
                    }
                };
                let envelope = serde_json::json!({
                    "message_type": entry.message_type,
                    "message_id": entry.message_id.to_string(),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "data": data,
                });

                if self.connections.send_to_agent(agent.agent_id, &envelope).await {
                    if entry.message_type == MessageType::Command.as_tag() {
                        self.connections
                            .note_pending_command(agent.agent_id, entry.message_id);
                    }
                    self.queue.mark_completed(entry.message_id).await?;
                } else {
                    // Transport failed mid-batch; release the claim so the
                    // row is retried on reconnect.
                    self.queue.release(entry.message_id).await?;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Periodic queue cleanup: deletes old COMPLETED rows, keeping FAILED rows
/// for debugging.
pub async fn run_queue_maintenance(queue: ServerMessageQueue, older_than_days: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match queue.cleanup_old_messages(older_than_days, true).await {
            Ok(0) => {}
            Ok(count) => info!(count, "queue maintenance deleted old messages"),
            Err(e) => error!(error = %e, "queue maintenance failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::messages::JsonMap;
    use crate::queue::{HostRef, QueuePriority, QueueStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TelemetrySink for CountingSink {
        async fn on_hardware_update(
            &self,
            _pool: &SqlitePool,
            _connection: &ConnectionInfo,
            _data: &JsonMap,
        ) -> Result<(), crate::router::TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        queue: ServerMessageQueue,
        hosts: HostStore,
        connections: Arc<ConnectionManager>,
        sink: Arc<CountingSink>,
        processor: InboundProcessor,
    }

    async fn fixture() -> Fixture {
        let db = DatabaseConnection::open_in_memory().await.expect("db");
        let pool = db.pool().clone();
        let queue = ServerMessageQueue::new(pool.clone());
        let hosts = HostStore::new(pool.clone());
        let connections = Arc::new(ConnectionManager::new());
        let sink = Arc::new(CountingSink::default());
        let processor = InboundProcessor::new(
            pool,
            queue.clone(),
            hosts.clone(),
            connections.clone(),
            Arc::new(ConfigPushManager::new()),
            sink.clone(),
            ProcessorConfig {
                stuck_in_progress_seconds: 30,
                host_batch_size: 10,
                expiration_timeout_minutes: 60,
                poll_interval: Duration::from_secs(5),
            },
        );
        Fixture {
            queue,
            hosts,
            connections,
            sink,
            processor,
        }
    }

    async fn enqueue_hardware(fixture: &Fixture, host: HostRef) -> Uuid {
        fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "hardware_update",
                &json!({"cpu_vendor": "GenuineIntel"}),
                QueueDirection::Inbound,
                host,
                QueuePriority::Normal,
            )
            .await
            .expect("enqueue")
    }

    #[tokio::test]
    async fn approved_host_messages_are_routed_and_completed() {
        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        fixture
            .hosts
            .set_approval(host.id, ApprovalStatus::Approved)
            .await
            .unwrap();
        let id = enqueue_hardware(&fixture, HostRef::Known(host.id)).await;

        fixture.processor.run_once().await.expect("tick");

        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 1);
        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn unapproved_host_is_drained_without_invoking_handlers() {
        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        for _ in 0..10 {
            enqueue_hardware(&fixture, HostRef::Known(host.id)).await;
        }

        fixture.processor.run_once().await.expect("tick");

        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 0);
        let stats = fixture.queue.stats().await.unwrap();
        assert_eq!(
            stats.pending + stats.in_progress + stats.completed + stats.failed,
            0,
            "all rows for the unapproved host must be gone"
        );
    }

    #[tokio::test]
    async fn missing_host_rows_are_deleted() {
        let fixture = fixture().await;
        enqueue_hardware(&fixture, HostRef::Known(crate::domain_types::HostId::generate())).await;

        fixture.processor.run_once().await.expect("tick");
        assert_eq!(fixture.queue.stats().await.unwrap().pending, 0);
        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_entry_resolves_host_by_payload_hostname() {
        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        fixture
            .hosts
            .set_approval(host.id, ApprovalStatus::Approved)
            .await
            .unwrap();

        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "hardware_update",
                &json!({
                    "cpu_vendor": "GenuineIntel",
                    "_connection_info": {"hostname": "node-1.example.com"}
                }),
                QueueDirection::Inbound,
                HostRef::Unregistered,
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        assert_eq!(fixture.sink.calls.load(Ordering::SeqCst), 1);
        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
    }

    #[tokio::test]
    async fn unregistered_entry_without_hostname_fails_permanently() {
        let fixture = fixture().await;
        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "hardware_update",
                &json!({"cpu_vendor": "GenuineIntel"}),
                QueueDirection::Inbound,
                HostRef::Unregistered,
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(
            entry.error_message.as_deref(),
            Some("Missing hostname in message data")
        );
    }

    #[tokio::test]
    async fn queued_system_info_registers_the_host() {
        let fixture = fixture().await;
        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "system_info",
                &json!({
                    "hostname": "fresh.example.com",
                    "platform": "Linux",
                    "_connection_info": {"hostname": "fresh.example.com", "platform": "Linux"}
                }),
                QueueDirection::Inbound,
                HostRef::Unregistered,
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
        let host = fixture
            .hosts
            .find_by_fqdn("fresh.example.com")
            .await
            .unwrap();
        assert!(host.is_some(), "registration must create the host");
    }

    #[tokio::test]
    async fn unknown_message_type_fails_the_entry() {
        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        fixture
            .hosts
            .set_approval(host.id, ApprovalStatus::Approved)
            .await
            .unwrap();
        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "quantum_status_update",
                &json!({}),
                QueueDirection::Inbound,
                HostRef::Known(host.id),
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("Unknown message type"));
    }

    #[tokio::test]
    async fn outbound_rows_are_delivered_to_live_sessions() {
        use crate::connection_manager::tests::FakeSocket;

        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        let socket = FakeSocket::healthy();
        let agent_id = fixture.connections.connect(socket.clone());
        fixture
            .connections
            .register(agent_id, "node-1.example.com", None, None, None, host.id);

        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "command",
                &json!({"command_type": "get_system_info", "parameters": {}, "timeout": 300}),
                QueueDirection::Outbound,
                HostRef::Known(host.id),
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Completed);
        let sent = socket.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["message_type"], json!("command"));
        assert_eq!(frame["message_id"], json!(id.to_string()));
        drop(sent);

        // The delivered command awaits its COMMAND_RESULT.
        assert!(
            fixture
                .connections
                .complete_pending_command("node-1.example.com", id)
        );
    }

    #[tokio::test]
    async fn outbound_rows_for_disconnected_hosts_stay_pending() {
        let fixture = fixture().await;
        let host = fixture
            .hosts
            .register("node-1.example.com", None, None, None)
            .await
            .unwrap();
        let id = fixture
            .queue
            .enqueue(
                Uuid::new_v4(),
                "command",
                &json!({"command_type": "get_system_info", "parameters": {}, "timeout": 300}),
                QueueDirection::Outbound,
                HostRef::Known(host.id),
                QueuePriority::Normal,
            )
            .await
            .unwrap();

        fixture.processor.run_once().await.expect("tick");

        let entry = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending, "no session, no delivery");
    }
}

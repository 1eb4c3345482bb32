//! Versioned configuration delivery to agents
//!
//! Builds per-hostname versioned config envelopes, sends them through the
//! connection manager, and tracks each push as pending until the agent
//! acknowledges it with a COMMAND_RESULT keyed on the envelope's message id.
//! Version counters are per-hostname and monotonic for the server's lifetime.

use crate::connection_manager::ConnectionManager;
use crate::domain_types::ConfigVersion;
use crate::messages::{JsonMap, MessageEnvelope};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A sent-but-unacknowledged configuration for one hostname
#[derive(Debug, Clone, Serialize)]
pub struct PendingConfig {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub target_hostname: String,
    pub config: Value,
    pub checksum: String,
    /// Message id of the CONFIG_UPDATE envelope; acknowledgments carry it as
    /// their `command_id`
    pub envelope_id: Uuid,
    /// Error reported by the last failed acknowledgment, if any
    pub last_error: Option<String>,
}

/// Manages configuration push operations to agents
#[derive(Default)]
pub struct ConfigPushManager {
    pending: DashMap<String, PendingConfig>,
    versions: DashMap<String, ConfigVersion>,
}

/// Serializes a JSON value with object keys sorted recursively and no
/// insignificant whitespace. Checksums are computed over this form so they
/// are stable across key permutations.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// First 16 hex characters of the SHA-256 of the canonical form
#[must_use]
pub fn config_checksum(config: &Value) -> String {
    let digest = Sha256::digest(canonical_json(config).as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

impl ConfigPushManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the versioned config object for one target, bumping that
    /// target's version counter.
    #[must_use]
    pub fn create_agent_config(&self, hostname: &str, config_data: &Value) -> PendingConfig {
        let version = self
            .versions
            .entry(hostname.to_string())
            .and_modify(|v| *v = v.next())
            .or_insert_with(|| ConfigVersion::default().next())
            .into_inner();

        PendingConfig {
            version,
            created_at: Utc::now(),
            target_hostname: hostname.to_string(),
            config: config_data.clone(),
            checksum: config_checksum(config_data),
            envelope_id: Uuid::nil(),
            last_error: None,
        }
    }

    /// Pushes configuration to a single agent. On transport success the push
    /// is recorded as pending (replacing any older pending config for that
    /// hostname); on failure the pending slot is discarded, since nothing
    /// was delivered.
    pub async fn push_config_to_agent(
        &self,
        connections: &ConnectionManager,
        hostname: &str,
        config_data: &Value,
    ) -> bool {
        let mut agent_config = self.create_agent_config(hostname, config_data);
        let envelope = Self::build_envelope(&agent_config, config_data);
        agent_config.envelope_id = envelope.message_id;

        let sent = connections
            .send_to_hostname(hostname, &envelope.to_value())
            .await;
        if sent {
            info!(hostname, version = agent_config.version, "configuration pushed to agent");
            self.pending.insert(hostname.to_string(), agent_config);
        } else {
            warn!(hostname, "failed to send configuration to agent");
            self.pending.remove(hostname);
        }
        sent
    }

    /// Pushes configuration to every connected, registered agent
    pub async fn push_config_to_all_agents(
        &self,
        connections: &ConnectionManager,
        config_data: &Value,
    ) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for agent in connections.get_active_agents() {
            if let Some(hostname) = agent.hostname {
                let sent = self
                    .push_config_to_agent(connections, &hostname, config_data)
                    .await;
                results.insert(hostname, sent);
            }
        }
        info!(agents = results.len(), "configuration push fanned out");
        results
    }

    /// Pushes one configuration to all agents of a platform. The version
    /// counter for a platform push lives under a synthetic
    /// `platform-<name>` key.
    pub async fn push_config_by_platform(
        &self,
        connections: &ConnectionManager,
        platform: &str,
        config_data: &Value,
    ) -> usize {
        let agent_config = self.create_agent_config(&format!("platform-{platform}"), config_data);
        let envelope = Self::build_envelope(&agent_config, config_data);
        let successful = connections
            .broadcast_to_platform(platform, &envelope.to_value())
            .await;
        info!(successful, platform, "configuration pushed by platform");
        successful
    }

    /// Handles a configuration acknowledgment from an agent. Unknown
    /// hostnames are logged and dropped; version mismatches retain the
    /// pending entry; failures retain it with the reported error.
    pub fn handle_config_acknowledgment(
        &self,
        hostname: &str,
        version: u64,
        success: bool,
        error_text: Option<&str>,
    ) {
        let Some(mut entry) = self.pending.get_mut(hostname) else {
            warn!(hostname, "received ack for unknown config");
            return;
        };
        if entry.version != version {
            warn!(
                hostname,
                expected = entry.version,
                got = version,
                "version mismatch in config ack"
            );
            return;
        }
        if success {
            info!(hostname, version, "configuration applied on agent");
            drop(entry);
            self.pending.remove(hostname);
        } else {
            error!(hostname, version, error = ?error_text, "configuration failed on agent");
            entry.last_error = error_text.map(ToString::to_string);
        }
    }

    /// Correlates a COMMAND_RESULT `command_id` with a pending config push
    /// for `hostname`. Returns the pending version when it matches.
    #[must_use]
    pub fn ack_version_for(&self, hostname: &str, command_id: Uuid) -> Option<u64> {
        self.pending
            .get(hostname)
            .filter(|entry| entry.envelope_id == command_id)
            .map(|entry| entry.version)
    }

    /// Snapshot of all pending pushes
    #[must_use]
    pub fn get_pending_configs(&self) -> Vec<PendingConfig> {
        self.pending.iter().map(|e| e.value().clone()).collect()
    }

    fn build_envelope(agent_config: &PendingConfig, config_data: &Value) -> MessageEnvelope {
        let requires_restart = config_data
            .get("requires_restart")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut data = JsonMap::new();
        data.insert("config".into(), agent_config.config.clone());
        data.insert("version".into(), Value::from(agent_config.version));
        data.insert(
            "checksum".into(),
            Value::String(agent_config.checksum.clone()),
        );
        data.insert("requires_restart".into(), Value::Bool(requires_restart));
        MessageEnvelope::config_update(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::tests::FakeSocket;
    use crate::domain_types::HostId;
    use proptest::prelude::*;
    use serde_json::json;

    fn registered_manager(hostname: &str) -> (ConnectionManager, std::sync::Arc<FakeSocket>) {
        let connections = ConnectionManager::new();
        let socket = FakeSocket::healthy();
        let agent_id = connections.connect(socket.clone());
        connections.register(agent_id, hostname, None, None, Some("Linux"), HostId::generate());
        (connections, socket)
    }

    #[test]
    fn checksum_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": [1, 2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": [1, 2], "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(config_checksum(&a), config_checksum(&b));
        assert_eq!(config_checksum(&a).len(), 16);
    }

    #[test]
    fn canonical_json_sorts_keys_without_whitespace() {
        let value = json!({"z": 1, "a": {"c": true, "b": null}});
        assert_eq!(canonical_json(&value), r#"{"a":{"b":null,"c":true},"z":1}"#);
    }

    #[tokio::test]
    async fn push_records_pending_and_versions_are_monotonic() {
        let (connections, socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();

        assert!(push.push_config_to_agent(&connections, "node-1", &json!({"k": 1})).await);
        assert!(push.push_config_to_agent(&connections, "node-1", &json!({"k": 2})).await);
        assert_eq!(socket.sent_count(), 2);

        let pending = push.get_pending_configs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);
        assert_eq!(pending[0].config, json!({"k": 2}));
    }

    #[tokio::test]
    async fn pushed_envelope_carries_the_config_verbatim() {
        let (connections, socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();
        let config_data = json!({
            "logging": {"level": "DEBUG"},
            "requires_restart": true
        });

        assert!(push.push_config_to_agent(&connections, "node-1", &config_data).await);

        let sent = socket.sent.lock().unwrap();
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["message_type"], json!("config_update"));
        // data.config is the opaque payload itself, not a wrapper around it.
        assert_eq!(frame["data"]["config"], config_data);
        assert_eq!(frame["data"]["version"], json!(1));
        assert_eq!(
            frame["data"]["checksum"],
            json!(config_checksum(&config_data))
        );
        assert_eq!(frame["data"]["requires_restart"], json!(true));
    }

    #[tokio::test]
    async fn late_ack_for_superseded_version_is_retained() {
        let (connections, _socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();
        push.push_config_to_agent(&connections, "node-1", &json!({"k": 1})).await;
        push.push_config_to_agent(&connections, "node-1", &json!({"k": 2})).await;

        // Agent acknowledges version 1 late; pending (version 2) must stay.
        push.handle_config_acknowledgment("node-1", 1, true, None);
        let pending = push.get_pending_configs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 2);
    }

    #[tokio::test]
    async fn successful_ack_clears_pending() {
        let (connections, _socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();
        push.push_config_to_agent(&connections, "node-1", &json!({"k": 1})).await;

        push.handle_config_acknowledgment("node-1", 1, true, None);
        assert!(push.get_pending_configs().is_empty());
    }

    #[tokio::test]
    async fn failed_ack_retains_pending_with_error() {
        let (connections, _socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();
        push.push_config_to_agent(&connections, "node-1", &json!({"k": 1})).await;

        push.handle_config_acknowledgment("node-1", 1, false, Some("disk full"));
        let pending = push.get_pending_configs();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn ack_for_unknown_hostname_is_dropped() {
        let push = ConfigPushManager::new();
        push.handle_config_acknowledgment("nowhere", 1, true, None);
        assert!(push.get_pending_configs().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_returns_false_and_keeps_no_pending() {
        let connections = ConnectionManager::new();
        let push = ConfigPushManager::new();
        assert!(!push.push_config_to_agent(&connections, "offline", &json!({"k": 1})).await);
        assert!(push.get_pending_configs().is_empty());
    }

    #[tokio::test]
    async fn envelope_correlates_acks_by_command_id() {
        let (connections, socket) = registered_manager("node-1");
        let push = ConfigPushManager::new();
        push.push_config_to_agent(&connections, "node-1", &json!({"k": 1})).await;

        let sent = socket.sent.lock().unwrap();
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        let envelope_id = Uuid::parse_str(frame["message_id"].as_str().unwrap()).unwrap();
        drop(sent);

        assert_eq!(push.ack_version_for("node-1", envelope_id), Some(1));
        assert_eq!(push.ack_version_for("node-1", Uuid::new_v4()), None);
    }

    proptest! {
        #[test]
        fn checksum_ignores_object_key_permutations(
            entries in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 1..8)
        ) {
            let forward: JsonMap = entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect();
            let reverse: JsonMap = entries
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect();
            prop_assert_eq!(
                config_checksum(&Value::Object(forward)),
                config_checksum(&Value::Object(reverse))
            );
        }
    }
}

//! Message protocol for server/agent WebSocket communication
//!
//! Every wire message is a four-field JSON envelope:
//! `{message_type, message_id, timestamp, data}`. The envelope is what flows
//! on the socket and what the durable queue persists. Unknown message types
//! deserialize to a generic envelope; routing decides what to do with them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// JSON object map used for envelope payloads
pub type JsonMap = serde_json::Map<String, Value>;

/// Protocol-level errors: a frame that is syntactically JSON but not a valid
/// envelope. Never fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message_type is missing or empty")]
    MissingType,

    #[error("invalid message_id '{value}': not a UUID")]
    InvalidMessageId { value: String },

    #[error("message_id is missing")]
    MissingMessageId,

    #[error("invalid timestamp '{value}': not ISO-8601")]
    InvalidTimestamp { value: String },

    #[error("timestamp is missing")]
    MissingTimestamp,
}

/// Closed set of message types in the fleet protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Agent -> server
    SystemInfo,
    Heartbeat,
    CommandResult,
    Error,
    OsVersionUpdate,
    HardwareUpdate,
    UserAccessUpdate,
    SoftwareInventoryUpdate,
    PackageUpdatesUpdate,
    UpdateApplyResult,
    ScriptExecutionResult,
    RebootStatusUpdate,
    DiagnosticCollectionResult,
    HostCertificatesUpdate,
    RoleData,
    ThirdPartyRepositoryUpdate,
    AntivirusStatusUpdate,
    CommercialAntivirusStatusUpdate,
    FirewallStatusUpdate,
    GraylogStatusUpdate,
    HostnameChanged,
    VirtualizationSupportUpdate,
    ChildHostListUpdate,
    ChildHostCreationProgress,
    ChildHostCreated,
    AvailablePackagesBatchStart,
    AvailablePackagesBatch,
    AvailablePackagesBatchEnd,

    // Server -> agent
    Command,
    UpdateRequest,
    Ping,
    Shutdown,
    HostApproved,
    ConfigUpdate,

    // Server -> agent acknowledgment of inline messages
    Ack,
}

impl MessageType {
    /// Wire tag for this message type
    #[must_use]
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::SystemInfo => "system_info",
            Self::Heartbeat => "heartbeat",
            Self::CommandResult => "command_result",
            Self::Error => "error",
            Self::OsVersionUpdate => "os_version_update",
            Self::HardwareUpdate => "hardware_update",
            Self::UserAccessUpdate => "user_access_update",
            Self::SoftwareInventoryUpdate => "software_inventory_update",
            Self::PackageUpdatesUpdate => "package_updates_update",
            Self::UpdateApplyResult => "update_apply_result",
            Self::ScriptExecutionResult => "script_execution_result",
            Self::RebootStatusUpdate => "reboot_status_update",
            Self::DiagnosticCollectionResult => "diagnostic_collection_result",
            Self::HostCertificatesUpdate => "host_certificates_update",
            Self::RoleData => "role_data",
            Self::ThirdPartyRepositoryUpdate => "third_party_repository_update",
            Self::AntivirusStatusUpdate => "antivirus_status_update",
            Self::CommercialAntivirusStatusUpdate => "commercial_antivirus_status_update",
            Self::FirewallStatusUpdate => "firewall_status_update",
            Self::GraylogStatusUpdate => "graylog_status_update",
            Self::HostnameChanged => "hostname_changed",
            Self::VirtualizationSupportUpdate => "virtualization_support_update",
            Self::ChildHostListUpdate => "child_host_list_update",
            Self::ChildHostCreationProgress => "child_host_creation_progress",
            Self::ChildHostCreated => "child_host_created",
            Self::AvailablePackagesBatchStart => "available_packages_batch_start",
            Self::AvailablePackagesBatch => "available_packages_batch",
            Self::AvailablePackagesBatchEnd => "available_packages_batch_end",
            Self::Command => "command",
            Self::UpdateRequest => "update_request",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
            Self::HostApproved => "host_approved",
            Self::ConfigUpdate => "config_update",
            Self::Ack => "ack",
        }
    }

    /// Parses a wire tag; `None` for tags outside the closed set
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "system_info" => Some(Self::SystemInfo),
            "heartbeat" => Some(Self::Heartbeat),
            "command_result" => Some(Self::CommandResult),
            "error" => Some(Self::Error),
            "os_version_update" => Some(Self::OsVersionUpdate),
            "hardware_update" => Some(Self::HardwareUpdate),
            "user_access_update" => Some(Self::UserAccessUpdate),
            "software_inventory_update" => Some(Self::SoftwareInventoryUpdate),
            "package_updates_update" => Some(Self::PackageUpdatesUpdate),
            "update_apply_result" => Some(Self::UpdateApplyResult),
            "script_execution_result" => Some(Self::ScriptExecutionResult),
            "reboot_status_update" => Some(Self::RebootStatusUpdate),
            "diagnostic_collection_result" => Some(Self::DiagnosticCollectionResult),
            "host_certificates_update" => Some(Self::HostCertificatesUpdate),
            "role_data" => Some(Self::RoleData),
            "third_party_repository_update" => Some(Self::ThirdPartyRepositoryUpdate),
            "antivirus_status_update" => Some(Self::AntivirusStatusUpdate),
            "commercial_antivirus_status_update" => Some(Self::CommercialAntivirusStatusUpdate),
            "firewall_status_update" => Some(Self::FirewallStatusUpdate),
            "graylog_status_update" => Some(Self::GraylogStatusUpdate),
            "hostname_changed" => Some(Self::HostnameChanged),
            "virtualization_support_update" => Some(Self::VirtualizationSupportUpdate),
            "child_host_list_update" => Some(Self::ChildHostListUpdate),
            "child_host_creation_progress" => Some(Self::ChildHostCreationProgress),
            "child_host_created" => Some(Self::ChildHostCreated),
            "available_packages_batch_start" => Some(Self::AvailablePackagesBatchStart),
            "available_packages_batch" => Some(Self::AvailablePackagesBatch),
            "available_packages_batch_end" => Some(Self::AvailablePackagesBatchEnd),
            "command" => Some(Self::Command),
            "update_request" => Some(Self::UpdateRequest),
            "ping" => Some(Self::Ping),
            "shutdown" => Some(Self::Shutdown),
            "host_approved" => Some(Self::HostApproved),
            "config_update" => Some(Self::ConfigUpdate),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Commands the server can dispatch to an agent inside a `COMMAND` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    ExecuteShell,
    InstallPackage,
    UpdateSystem,
    ApplyUpdates,
    RestartService,
    GetSystemInfo,
    GetInstalledPackages,
    GetAvailableUpdates,
    RebootSystem,
    ShutdownSystem,
    ExecuteScript,
    CheckRebootStatus,
    CollectDiagnostics,
    CollectCertificates,
    CollectRoles,
    CollectAvailablePackages,
    ServiceControl,
    UpdateSoftwareInventory,
    EnablePackageManager,
    GenericCommand,
    UbuntuProAttach,
    UbuntuProDetach,
    UbuntuProEnableService,
    UbuntuProDisableService,
    DeployOpentelemetry,
    RemoveOpentelemetry,
    StartOpentelemetryService,
    StopOpentelemetryService,
    RestartOpentelemetryService,
    ConnectOpentelemetryGrafana,
    DisconnectOpentelemetryGrafana,
}

impl CommandType {
    /// Wire tag for this command type
    #[must_use]
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::ExecuteShell => "execute_shell",
            Self::InstallPackage => "install_package",
            Self::UpdateSystem => "update_system",
            Self::ApplyUpdates => "apply_updates",
            Self::RestartService => "restart_service",
            Self::GetSystemInfo => "get_system_info",
            Self::GetInstalledPackages => "get_installed_packages",
            Self::GetAvailableUpdates => "get_available_updates",
            Self::RebootSystem => "reboot_system",
            Self::ShutdownSystem => "shutdown_system",
            Self::ExecuteScript => "execute_script",
            Self::CheckRebootStatus => "check_reboot_status",
            Self::CollectDiagnostics => "collect_diagnostics",
            Self::CollectCertificates => "collect_certificates",
            Self::CollectRoles => "collect_roles",
            Self::CollectAvailablePackages => "collect_available_packages",
            Self::ServiceControl => "service_control",
            Self::UpdateSoftwareInventory => "update_software_inventory",
            Self::EnablePackageManager => "enable_package_manager",
            Self::GenericCommand => "generic_command",
            Self::UbuntuProAttach => "ubuntu_pro_attach",
            Self::UbuntuProDetach => "ubuntu_pro_detach",
            Self::UbuntuProEnableService => "ubuntu_pro_enable_service",
            Self::UbuntuProDisableService => "ubuntu_pro_disable_service",
            Self::DeployOpentelemetry => "deploy_opentelemetry",
            Self::RemoveOpentelemetry => "remove_opentelemetry",
            Self::StartOpentelemetryService => "start_opentelemetry_service",
            Self::StopOpentelemetryService => "stop_opentelemetry_service",
            Self::RestartOpentelemetryService => "restart_opentelemetry_service",
            Self::ConnectOpentelemetryGrafana => "connect_opentelemetry_grafana",
            Self::DisconnectOpentelemetryGrafana => "disconnect_opentelemetry_grafana",
        }
    }
}

/// Default command acknowledgment deadline carried in COMMAND envelopes
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// A versioned wire message. `extra` holds top-level keys beyond the four
/// envelope fields so that legacy frames round-trip unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Raw wire tag. Tags outside [`MessageType`] are preserved verbatim.
    pub message_type: String,
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: JsonMap,
    pub extra: JsonMap,
}

const ENVELOPE_FIELDS: [&str; 4] = ["message_type", "message_id", "timestamp", "data"];

impl MessageEnvelope {
    /// Creates an envelope with a fresh message id and current timestamp
    #[must_use]
    pub fn new(message_type: MessageType, data: JsonMap) -> Self {
        Self {
            message_type: message_type.as_tag().to_string(),
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            data,
            extra: JsonMap::new(),
        }
    }

    /// Replaces the generated message id. Used by acknowledgments that are
    /// keyed on the id of the message they acknowledge.
    #[must_use]
    pub fn with_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    /// The typed message kind, or `None` for tags outside the closed set
    #[must_use]
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_tag(&self.message_type)
    }

    /// Serializes the envelope to its wire object
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = JsonMap::new();
        obj.insert("message_type".into(), Value::String(self.message_type.clone()));
        obj.insert(
            "message_id".into(),
            Value::String(self.message_id.to_string()),
        );
        obj.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        obj.insert("data".into(), Value::Object(self.data.clone()));
        for (key, value) in &self.extra {
            if !ENVELOPE_FIELDS.contains(&key.as_str()) {
                obj.insert(key.clone(), value.clone());
            }
        }
        Value::Object(obj)
    }

    /// Serializes the envelope to the JSON text that flows on the socket
    ///
    /// # Errors
    ///
    /// Returns a serialization error; payloads are plain JSON values so this
    /// only fails on pathological data.
    pub fn to_wire_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }

    /// Builds a COMMAND envelope
    #[must_use]
    pub fn command(command_type: CommandType, parameters: JsonMap, timeout_secs: u64) -> Self {
        let mut data = JsonMap::new();
        data.insert(
            "command_type".into(),
            Value::String(command_type.as_tag().to_string()),
        );
        data.insert("parameters".into(), Value::Object(parameters));
        data.insert("timeout".into(), Value::from(timeout_secs));
        Self::new(MessageType::Command, data)
    }

    /// Builds a COMMAND_RESULT envelope (agent side of the contract; used by
    /// tests and by loopback tooling)
    #[must_use]
    pub fn command_result(command_id: Uuid, success: bool, result: Option<Value>) -> Self {
        let mut data = JsonMap::new();
        data.insert("command_id".into(), Value::String(command_id.to_string()));
        data.insert("success".into(), Value::Bool(success));
        data.insert("result".into(), result.unwrap_or(Value::Null));
        Self::new(MessageType::CommandResult, data)
    }

    /// Builds the heartbeat acknowledgment, keyed on the heartbeat's id
    #[must_use]
    pub fn heartbeat_ack(heartbeat_id: Uuid) -> Self {
        let mut data = JsonMap::new();
        data.insert("status".into(), Value::String("heartbeat_received".into()));
        Self::new(MessageType::Ack, data).with_id(heartbeat_id)
    }

    /// Builds the registration acknowledgment sent after SYSTEM_INFO
    #[must_use]
    pub fn registration_ack(host_id: &str, approval_status: &str, hostname: &str) -> Self {
        let mut data = JsonMap::new();
        data.insert("status".into(), Value::String("registered".into()));
        data.insert("host_id".into(), Value::String(host_id.to_string()));
        data.insert(
            "approval_status".into(),
            Value::String(approval_status.to_string()),
        );
        data.insert("hostname".into(), Value::String(hostname.to_string()));
        Self::new(MessageType::Ack, data)
    }

    /// Builds an ERROR envelope for protocol failures
    #[must_use]
    pub fn error(error_code: &str, error_message: &str) -> Self {
        let mut data = JsonMap::new();
        data.insert("error_code".into(), Value::String(error_code.to_string()));
        data.insert(
            "error_message".into(),
            Value::String(error_message.to_string()),
        );
        Self::new(MessageType::Error, data)
    }

    /// Builds the HOST_APPROVED notification
    #[must_use]
    pub fn host_approved(host_id: &str, approval_status: &str, certificate: Option<&str>) -> Self {
        let mut data = JsonMap::new();
        data.insert("host_id".into(), Value::String(host_id.to_string()));
        data.insert(
            "approval_status".into(),
            Value::String(approval_status.to_string()),
        );
        data.insert(
            "certificate".into(),
            certificate.map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        Self::new(MessageType::HostApproved, data)
    }

    /// Builds a CONFIG_UPDATE envelope
    #[must_use]
    pub fn config_update(data: JsonMap) -> Self {
        Self::new(MessageType::ConfigUpdate, data)
    }

    /// Builds a PING envelope
    #[must_use]
    pub fn ping() -> Self {
        Self::new(MessageType::Ping, JsonMap::new())
    }
}

/// Validates an incoming wire frame before typed construction: id present
/// and a UUID, type non-empty, timestamp present and parseable.
///
/// # Errors
///
/// Returns the first [`ProtocolError`] found.
pub fn validate_wire(raw: &Value) -> Result<(), ProtocolError> {
    let obj = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

    obj.get("message_type")
        .and_then(Value::as_str)
        .filter(|tag| !tag.is_empty())
        .ok_or(ProtocolError::MissingType)?;

    let id = obj
        .get("message_id")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingMessageId)?;
    Uuid::parse_str(id).map_err(|_| ProtocolError::InvalidMessageId {
        value: id.to_string(),
    })?;

    let ts = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingTimestamp)?;
    DateTime::parse_from_rfc3339(ts).map_err(|_| ProtocolError::InvalidTimestamp {
        value: ts.to_string(),
    })?;

    Ok(())
}

/// Factory from a raw wire object to a typed envelope.
///
/// Missing `message_id`/`timestamp` are filled in (fresh id, current time) so
/// server-built payloads can omit them; present-but-invalid values are
/// protocol errors. Unknown `message_type` tags yield a generic envelope.
///
/// Compatibility: `script_execution_result` frames historically carry their
/// payload at the top level of the envelope instead of under `data`; those
/// fields are folded into `data` here.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on malformed envelope fields.
pub fn create_message(raw: &Value) -> Result<MessageEnvelope, ProtocolError> {
    let obj = raw.as_object().ok_or(ProtocolError::NotAnObject)?;

    let message_type = obj
        .get("message_type")
        .and_then(Value::as_str)
        .filter(|tag| !tag.is_empty())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    let message_id = match obj.get("message_id") {
        None | Some(Value::Null) => Uuid::new_v4(),
        Some(value) => {
            let text = value.as_str().ok_or_else(|| ProtocolError::InvalidMessageId {
                value: value.to_string(),
            })?;
            Uuid::parse_str(text).map_err(|_| ProtocolError::InvalidMessageId {
                value: text.to_string(),
            })?
        }
    };

    let timestamp = match obj.get("timestamp") {
        None | Some(Value::Null) => Utc::now(),
        Some(value) => {
            let text = value.as_str().ok_or_else(|| ProtocolError::InvalidTimestamp {
                value: value.to_string(),
            })?;
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ProtocolError::InvalidTimestamp {
                    value: text.to_string(),
                })?
        }
    };

    let mut data = obj
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let fold_into_data = message_type == MessageType::ScriptExecutionResult.as_tag();
    let mut extra = JsonMap::new();
    for (key, value) in obj {
        if ENVELOPE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if fold_into_data {
            data.entry(key.clone()).or_insert_with(|| value.clone());
        } else {
            extra.insert(key.clone(), value.clone());
        }
    }

    Ok(MessageEnvelope {
        message_type,
        message_id,
        timestamp,
        data,
        extra,
    })
}

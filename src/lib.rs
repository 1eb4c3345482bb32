//! # fleetd - Fleet Control Plane
//!
//! fleetd keeps persistent bidirectional WebSocket sessions open with a
//! fleet of remote agents, dispatches commands to them, ingests their
//! telemetry, and guarantees durable, ordered, at-most-once processing of
//! every message through a SQLite-backed queue that survives agent
//! disconnects, server restarts, and partial failures.
//!
//! ## Core Components
//!
//! - [`connection_manager`]: the live set of authenticated agent sessions
//!   and the routing primitives over them
//! - [`queue`]: the persisted inbound/outbound work store with its state
//!   machine, priorities, expiration, and stuck-row recovery
//! - [`processor`]: the periodic worker that drains the queue, validates
//!   hosts, and routes messages in per-host order
//! - [`config_push`]: versioned, acknowledged configuration delivery
//! - [`auth`]: short-lived connection-token issuance and validation
//! - [`ws`]: the agent WebSocket endpoint (inline registration/heartbeat,
//!   everything else queued)
//!
//! ## Message Flow
//!
//! ```text
//! Agent --WS--> ws -> connection_manager registry
//!                  |
//!                  +- SYSTEM_INFO / HEARTBEAT -> handled inline
//!                  +- everything else         -> queue (inbound)
//!                                                  |
//!                                                  v
//!                                         processor -> router -> handlers
//!
//! REST/admin -> config_push / queue (outbound) -> connection_manager --WS--> Agent
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod config_push;
pub mod connection_manager;
pub mod database;
pub mod domain_types;
pub mod hosts;
pub mod messages;
pub mod processor;
pub mod queue;
pub mod router;
pub mod ws;

pub use api::{AppState, build_router};
pub use auth::{AuthError, ConnectionAuthenticator};
pub use config::AppConfig;
pub use config_push::ConfigPushManager;
pub use connection_manager::{AgentSocket, ConnectionManager, SocketError};
pub use database::DatabaseConnection;
pub use domain_types::{AgentId, ConfigVersion, HostId, Hostname};
pub use hosts::{ApprovalStatus, HostRecord, HostStore};
pub use messages::{CommandType, MessageEnvelope, MessageType, create_message};
pub use processor::{InboundProcessor, ProcessorConfig};
pub use queue::{
    HostRef, QueueDirection, QueuePriority, QueueStatus, ServerMessageQueue,
};
pub use router::{LoggingTelemetrySink, RouteOutcome, TelemetrySink};

//! RPC message shapes carried over the secure transport (§6 RPC surface).
//!
//! Each request type is the sole payload a stream of that kind ever
//! carries: `Register`/`GetRoutes`/`UpdateStatus` streams carry exactly
//! one request and one response, `Heartbeat` and `RelayData` streams
//! carry a homogeneous sequence of the same message shape in both
//! directions for the life of the stream.

use serde::{Deserialize, Serialize};

use crate::model::{AgentMetadata, AgentStatus, AgentType, RuleAction};

/// Discriminant sent as the very first byte of every freshly opened
/// bidirectional stream, so the coordinator knows how to decode what
/// follows before it has parsed a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Register = 0,
    Heartbeat = 1,
    RelayData = 2,
    GetRoutes = 3,
    UpdateStatus = 4,
}

impl StreamKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamKind::Register),
            1 => Some(StreamKind::Heartbeat),
            2 => Some(StreamKind::RelayData),
            3 => Some(StreamKind::GetRoutes),
            4 => Some(StreamKind::UpdateStatus),
            _ => None,
        }
    }
}

/// The protocol versions this build of the coordinator accepts.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0.0"];
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MINIMUM_SUPPORTED_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub api_key: String,
    pub agent_type: AgentType,
    pub protocol_version: String,
    pub bandwidth: u32,
    pub metadata: AgentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub gateway_ip: String,
    pub netmask: String,
    pub mtu: u16,
    pub keepalive_interval: u32,
    pub keepalive_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    pub session_id: Option<String>,
    pub assigned_ip: Option<String>,
    pub server_version: String,
    pub minimum_supported_version: String,
    pub server_config: Option<ServerConfig>,
    pub error_message: Option<String>,
}

impl RegisterResponse {
    pub fn incompatible() -> Self {
        Self {
            accepted: false,
            session_id: None,
            assigned_ip: None,
            server_version: SERVER_VERSION.to_string(),
            minimum_supported_version: MINIMUM_SUPPORTED_VERSION.to_string(),
            server_config: None,
            error_message: Some("incompatible".to_string()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            session_id: None,
            assigned_ip: None,
            server_version: SERVER_VERSION.to_string(),
            minimum_supported_version: MINIMUM_SUPPORTED_VERSION.to_string(),
            server_config: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors: u64,
    pub drops: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub session_id: String,
    pub timestamp: i64,
    pub stats: Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub alive: bool,
    pub timestamp: i64,
}

/// A single IP datagram in flight on a `RelayData` stream. The first
/// message sent on a fresh stream carries an empty `payload` and serves
/// only to identify the session (§4.2.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPacket {
    pub session_id: String,
    pub source_agent_id: String,
    pub destination_agent_id: Option<String>,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn identify(session_id: impl Into<String>, source_agent_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            source_agent_id: source_agent_id.into(),
            destination_agent_id: None,
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoutesRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRule {
    pub rule_id: i64,
    pub action: RuleAction,
    pub destination: String,
    pub gateway_id: Option<String>,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoutesResponse {
    pub rules: Vec<WireRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub agent_id: String,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub acknowledged: bool,
    pub message: Option<String>,
}

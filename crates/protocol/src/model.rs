//! Shared data model (§3 of the specification): users, agents, sessions
//! and routing rules as they travel over the wire or sit in the
//! repository. These types carry no behavior beyond (de)serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role an agent plays in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Client,
    Gateway,
}

/// Lifecycle status of an agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

/// Lifecycle status of a user principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Disabled,
}

impl UserStatus {
    pub fn is_active(self) -> bool {
        matches!(self, UserStatus::Active)
    }
}

/// Action a routing rule takes for matching destination traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Forward,
    Direct,
    Deny,
}

/// Free-form client-reported metadata, carried verbatim in `Register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub hostname: String,
}

/// Identity principal. The core only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub api_key: String,
    pub status: UserStatus,
}

/// Durable record for a registered client or gateway (§3 Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub agent_type: AgentType,
    pub overlay_ip: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub bandwidth_limit: Option<u32>,
    pub metadata: AgentMetadata,
}

/// Ephemeral record for a live agent connection (§3 Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Client-side policy row (§3 Routing Rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: i64,
    pub agent_id: String,
    pub action: RuleAction,
    pub destination: String,
    pub gateway_id: Option<String>,
    pub priority: i32,
    pub enabled: bool,
}

//! Repository surface (§6): the persistence interface the core consumes
//! and never implements with anything of its own beyond the two
//! concrete backends here. Kept narrow and flat — one method per
//! operation named in §6, not a generic CRUD trait — so a reader can
//! match each method directly against the spec's table.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use tunnel_protocol::model::{Agent, AgentStatus, RoutingRule, Session, User};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// A single audit log entry (§6 Persistent schema `audit_logs`).
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub ip_address: Option<String>,
    pub status: String,
    pub details: serde_json::Value,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user_by_api_key(&self, api_key: &str) -> Result<User>;

    async fn get_agent(&self, agent_id: &str) -> Result<Agent>;

    async fn create_agent(&self, agent: &Agent) -> Result<()>;

    async fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()>;

    /// All agents ever persisted, used to rebuild the address pool's
    /// allocation map at coordinator startup (§3 Address Allocation
    /// lifecycle: "rebuilt at coordinator startup from persisted agent
    /// records").
    async fn list_all_agents(&self) -> Result<Vec<Agent>>;

    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn update_session_stats(&self, session_id: &str, sent: u64, received: u64) -> Result<()>;

    /// Enabled routing rules for `agent_id`, ascending by priority
    /// (§4.2.4, §6).
    async fn list_routing_rules_for_agent(&self, agent_id: &str) -> Result<Vec<RoutingRule>>;

    async fn record_audit_log(&self, entry: AuditEntry) -> Result<()>;
}

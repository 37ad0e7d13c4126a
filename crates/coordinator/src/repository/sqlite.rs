//! SQLite-backed [`Repository`] (§6 Persistent schema). Grounded on
//! `mycrl-turn-rs/cluster/router`, the one repo in the corpus that
//! reaches for `sqlx` with the `sqlite` + `runtime-tokio-rustls`
//! features for exactly this kind of small control-plane store.
//!
//! Schema is created with plain `CREATE TABLE IF NOT EXISTS` statements
//! rather than `sqlx::migrate!`, since the spec treats the schema as a
//! DBMS-agnostic shape (§6) rather than a migration history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Row, SqlitePool};
use tunnel_protocol::model::{Agent, AgentMetadata, AgentStatus, AgentType, RoutingRule, RuleAction, Session, User, UserStatus};

use super::{AuditEntry, Repository, RepositoryError, Result};

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> sqlx::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> sqlx::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE,
                email TEXT UNIQUE,
                password_hash TEXT,
                api_key TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                ip_address TEXT,
                public_ip TEXT,
                last_heartbeat TEXT,
                bandwidth_limit INTEGER,
                certificate_fingerprint TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                connection_id TEXT UNIQUE NOT NULL,
                connected_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                bytes_sent INTEGER NOT NULL DEFAULT 0,
                bytes_received INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS routing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                action TEXT NOT NULL,
                destination TEXT NOT NULL,
                gateway_id TEXT,
                priority INTEGER NOT NULL,
                enabled INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                agent_id TEXT,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                ip_address TEXT,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn user_status_to_str(s: UserStatus) -> &'static str {
    match s {
        UserStatus::Active => "active",
        UserStatus::Suspended => "suspended",
        UserStatus::Disabled => "disabled",
    }
}

fn user_status_from_str(s: &str) -> UserStatus {
    match s {
        "suspended" => UserStatus::Suspended,
        "disabled" => UserStatus::Disabled,
        _ => UserStatus::Active,
    }
}

fn agent_type_to_str(t: AgentType) -> &'static str {
    match t {
        AgentType::Client => "client",
        AgentType::Gateway => "gateway",
    }
}

fn agent_type_from_str(s: &str) -> AgentType {
    match s {
        "gateway" => AgentType::Gateway,
        _ => AgentType::Client,
    }
}

fn agent_status_to_str(s: AgentStatus) -> &'static str {
    match s {
        AgentStatus::Online => "online",
        AgentStatus::Offline => "offline",
        AgentStatus::Error => "error",
    }
}

fn agent_status_from_str(s: &str) -> AgentStatus {
    match s {
        "online" => AgentStatus::Online,
        "error" => AgentStatus::Error,
        _ => AgentStatus::Offline,
    }
}

fn rule_action_to_str(a: RuleAction) -> &'static str {
    match a {
        RuleAction::Forward => "forward",
        RuleAction::Direct => "direct",
        RuleAction::Deny => "deny",
    }
}

fn rule_action_from_str(s: &str) -> RuleAction {
    match s {
        "forward" => RuleAction::Forward,
        "deny" => RuleAction::Deny,
        _ => RuleAction::Direct,
    }
}

#[derive(FromRow)]
struct AgentRow {
    id: String,
    user_id: String,
    #[sqlx(rename = "type")]
    agent_type: String,
    status: String,
    ip_address: Option<String>,
    last_heartbeat: Option<String>,
    bandwidth_limit: Option<i64>,
    metadata: String,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        let metadata: AgentMetadata = serde_json::from_str(&row.metadata).unwrap_or_default();
        Agent {
            id: row.id,
            user_id: row.user_id,
            agent_type: agent_type_from_str(&row.agent_type),
            overlay_ip: row.ip_address,
            status: agent_status_from_str(&row.status),
            last_heartbeat: row
                .last_heartbeat
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            bandwidth_limit: row.bandwidth_limit.map(|v| v as u32),
            metadata,
        }
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_user_by_api_key(&self, api_key: &str) -> Result<User> {
        let row = sqlx::query("SELECT id, api_key, status FROM users WHERE api_key = ?1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        Ok(User {
            id: row.get("id"),
            api_key: row.get("api_key"),
            status: user_status_from_str(row.get::<String, _>("status").as_str()),
        })
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT id, user_id, type, status, ip_address, last_heartbeat, bandwidth_limit, metadata
             FROM agents WHERE id = ?1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?
        .ok_or(RepositoryError::NotFound)?;

        Ok(row.into())
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let metadata = serde_json::to_string(&agent.metadata).unwrap_or_default();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO agents (id, user_id, type, status, ip_address, last_heartbeat, bandwidth_limit, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                type = excluded.type,
                status = excluded.status,
                ip_address = excluded.ip_address,
                bandwidth_limit = excluded.bandwidth_limit,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
        )
        .bind(&agent.id)
        .bind(&agent.user_id)
        .bind(agent_type_to_str(agent.agent_type))
        .bind(agent_status_to_str(agent.status))
        .bind(&agent.overlay_ip)
        .bind(agent.last_heartbeat.map(|dt| dt.to_rfc3339()))
        .bind(agent.bandwidth_limit.map(|v| v as i64))
        .bind(metadata)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(agent_status_to_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_all_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, user_id, type, status, ip_address, last_heartbeat, bandwidth_limit, metadata FROM agents",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, agent_id, connection_id, connected_at, last_activity, bytes_sent, bytes_received)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&session.id)
        .bind(&session.agent_id)
        .bind(&session.connection_id)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity.to_rfc3339())
        .bind(session.bytes_sent as i64)
        .bind(session.bytes_received as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn update_session_stats(&self, session_id: &str, sent: u64, received: u64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET bytes_sent = ?1, bytes_received = ?2, last_activity = ?3 WHERE id = ?4",
        )
        .bind(sent as i64)
        .bind(received as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_routing_rules_for_agent(&self, agent_id: &str) -> Result<Vec<RoutingRule>> {
        let rows = sqlx::query(
            "SELECT id, agent_id, action, destination, gateway_id, priority, enabled
             FROM routing_rules WHERE agent_id = ?1 AND enabled = 1 ORDER BY priority ASC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| RoutingRule {
                id: row.get("id"),
                agent_id: row.get("agent_id"),
                action: rule_action_from_str(row.get::<String, _>("action").as_str()),
                destination: row.get("destination"),
                gateway_id: row.get("gateway_id"),
                priority: row.get("priority"),
                enabled: row.get::<i64, _>("enabled") != 0,
            })
            .collect())
    }

    async fn record_audit_log(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (user_id, agent_id, action, resource_type, resource_id, ip_address, status, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(entry.user_id)
        .bind(entry.agent_id)
        .bind(entry.action)
        .bind(entry.resource_type)
        .bind(entry.resource_id)
        .bind(entry.ip_address)
        .bind(entry.status)
        .bind(entry.details.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::model::AgentMetadata;

    async fn repo() -> SqliteRepository {
        SqliteRepository::connect("sqlite::memory:", 1).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_get_agent_round_trips() {
        let repo = repo().await;
        let agent = Agent {
            id: "agent-1".into(),
            user_id: "user-1".into(),
            agent_type: AgentType::Client,
            overlay_ip: Some("10.200.0.2".into()),
            status: AgentStatus::Online,
            last_heartbeat: None,
            bandwidth_limit: Some(1000),
            metadata: AgentMetadata {
                os: "linux".into(),
                arch: "x86_64".into(),
                version: "1.0.0".into(),
                hostname: "box".into(),
            },
        };
        repo.create_agent(&agent).await.unwrap();
        let fetched = repo.get_agent("agent-1").await.unwrap();
        assert_eq!(fetched.user_id, "user-1");
        assert_eq!(fetched.overlay_ip.as_deref(), Some("10.200.0.2"));
        assert_eq!(fetched.metadata.hostname, "box");
    }

    #[tokio::test]
    async fn missing_agent_is_not_found() {
        let repo = repo().await;
        assert!(matches!(repo.get_agent("nope").await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn update_status_of_missing_agent_is_not_found() {
        let repo = repo().await;
        assert!(matches!(
            repo.update_agent_status("nope", AgentStatus::Offline).await,
            Err(RepositoryError::NotFound)
        ));
    }
}

//! In-memory [`Repository`] implementation, used by default in
//! development and throughout the router's unit tests. Mirrors the
//! shape of the SQLite backend exactly so tests exercising one
//! exercise the same contract as the other.

use std::sync::Mutex;

use async_trait::async_trait;
use tunnel_protocol::model::{Agent, AgentStatus, RoutingRule, Session, User};

use super::{AuditEntry, Repository, RepositoryError, Result};

#[derive(Default)]
pub struct InMemoryRepository {
    users: Mutex<Vec<User>>,
    agents: Mutex<Vec<Agent>>,
    sessions: Mutex<Vec<Session>>,
    routing_rules: Mutex<Vec<RoutingRule>>,
    audit_logs: Mutex<Vec<AuditEntry>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_user(&self, user: User) {
        self.users.lock().unwrap().push(user);
    }

    pub fn seed_routing_rule(&self, rule: RoutingRule) {
        self.routing_rules.lock().unwrap().push(rule);
    }

    pub fn audit_log_actions(&self) -> Vec<String> {
        self.audit_logs.lock().unwrap().iter().map(|e| e.action.clone()).collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user_by_api_key(&self, api_key: &str) -> Result<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.api_key == api_key)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let mut agents = self.agents.lock().unwrap();
        if let Some(existing) = agents.iter_mut().find(|a| a.id == agent.id) {
            *existing = agent.clone();
        } else {
            agents.push(agent.clone());
        }
        Ok(())
    }

    async fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or(RepositoryError::NotFound)?;
        agent.status = status;
        Ok(())
    }

    async fn list_all_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.lock().unwrap().clone())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.sessions.lock().unwrap().push(session.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().unwrap().retain(|s| s.id != session_id);
        Ok(())
    }

    async fn update_session_stats(&self, session_id: &str, sent: u64, received: u64) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.bytes_sent = sent;
            session.bytes_received = received;
        }
        Ok(())
    }

    async fn list_routing_rules_for_agent(&self, agent_id: &str) -> Result<Vec<RoutingRule>> {
        let mut rules: Vec<RoutingRule> = self
            .routing_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent_id == agent_id && r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.priority);
        Ok(rules)
    }

    async fn record_audit_log(&self, entry: AuditEntry) -> Result<()> {
        self.audit_logs.lock().unwrap().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_protocol::model::RuleAction;

    #[tokio::test]
    async fn routing_rules_are_sorted_by_priority_and_filtered_to_enabled() {
        let repo = InMemoryRepository::new();
        repo.seed_routing_rule(RoutingRule {
            id: 1,
            agent_id: "c".into(),
            action: RuleAction::Forward,
            destination: "10.0.0.0/8".into(),
            gateway_id: Some("gw".into()),
            priority: 50,
            enabled: true,
        });
        repo.seed_routing_rule(RoutingRule {
            id: 2,
            agent_id: "c".into(),
            action: RuleAction::Direct,
            destination: "192.168.1.0/24".into(),
            gateway_id: None,
            priority: 10,
            enabled: true,
        });
        repo.seed_routing_rule(RoutingRule {
            id: 3,
            agent_id: "c".into(),
            action: RuleAction::Deny,
            destination: "172.16.0.0/12".into(),
            gateway_id: None,
            priority: 5,
            enabled: false,
        });

        let rules = repo.list_routing_rules_for_agent("c").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 10);
        assert_eq!(rules[1].priority, 50);
        assert!(rules.iter().all(|r| r.enabled));
    }
}

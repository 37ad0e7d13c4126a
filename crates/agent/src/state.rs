//! Shared agent state (§4.4): identity and the handles to the two
//! platform-boundary traits, cloned into every task the runtime spawns.
//! Deliberately thin — unlike the coordinator there is no cross-task
//! mutable table here, just `Arc`-shared trait objects (§5 "Virtual
//! interface: single-owner" — the `Arc` only exists so both the uplink
//! and downlink tasks can call it, never to grant a second owner write
//! access to anything the interface itself doesn't already serialize).

use std::sync::Arc;

use tunnel_protocol::config::AgentConfig;

use crate::iface::VirtualInterface;
use crate::routes::RouteInstaller;

#[derive(Clone)]
pub struct AgentState {
    pub config: Arc<AgentConfig>,
    pub agent_id: String,
    pub iface: Arc<dyn VirtualInterface>,
    pub routes: Arc<dyn RouteInstaller>,
}

impl AgentState {
    pub fn new(
        config: AgentConfig,
        agent_id: String,
        iface: Arc<dyn VirtualInterface>,
        routes: Arc<dyn RouteInstaller>,
    ) -> Self {
        Self { config: Arc::new(config), agent_id, iface, routes }
    }
}

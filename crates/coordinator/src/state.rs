//! Shared application state (§5, §9 Design Notes: session table and
//! address pool as process-global singletons injected into RPC
//! handlers). Mirrors the teacher's `AppState` — a small `Clone`
//! struct of `Arc`s passed into every connection task — generalized
//! from WebSocket connections to `quinn` streams.

use std::sync::Arc;

use tunnel_protocol::config::NetworkConfig;

use crate::pool::AddressPool;
use crate::repository::Repository;
use crate::session::SessionTable;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionTable,
    pub pool: Arc<AddressPool>,
    pub repository: Arc<dyn Repository>,
    pub network: Arc<NetworkConfig>,
}

impl AppState {
    pub fn new(pool: AddressPool, repository: Arc<dyn Repository>, network: NetworkConfig) -> Self {
        Self {
            sessions: SessionTable::new(),
            pool: Arc::new(pool),
            repository,
            network: Arc::new(network),
        }
    }
}

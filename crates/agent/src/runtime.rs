//! Agent runtime state machine (§4.4).
//!
//! Lifecycle: `Init → Dialing → Registering → InterfaceUp → Routing
//! (client only) → Relaying ↔ Rebuilding → Stopped`. One iteration of
//! the outer loop is one connection attempt; `Rebuilding` feeds back
//! into `Dialing` without tearing down the virtual interface, so a
//! coordinator restart or session replacement is invisible to whatever
//! is using the tunnel at the IP layer.
//!
//! Grounded on `manhpham90vn-tunnel/client/src-tauri/src/agent.rs`'s
//! `run_agent_loop` (reconnect loop, outbound/heartbeat tasks spawned
//! per-connection and aborted on disconnect) and `relay.rs`'s
//! `handle_stream_relay` (split read/write halves into two tasks).

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, RecvStream, SendStream};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tunnel_protocol::config::AgentMode;
use tunnel_protocol::messages::{
    DataPacket, GetRoutesRequest, GetRoutesResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, Stats, StreamKind, WireRule, SUPPORTED_PROTOCOL_VERSIONS,
};
use tunnel_protocol::model::{AgentType, RuleAction};
use tunnel_protocol::wire::{read_frame, write_frame, write_stream_kind};

use crate::error::{AgentError, Result};
use crate::state::AgentState;
use crate::transport;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUF_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Dialing,
    Registering,
    InterfaceUp,
    Routing,
    Relaying,
    Rebuilding,
    Stopped,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// Runs the agent until `shutdown` observes `true`, then performs the
/// reverse-order cleanup of step 8 and returns.
pub async fn run(state: AgentState, mut shutdown: watch::Receiver<bool>) {
    info!(state = ?LifecycleState::Init, agent_id = %state.agent_id, "agent starting");
    let mut attempt: u32 = 0;

    let server_addr = match resolve_server(&state.config.server) {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "cannot resolve configured server address, aborting");
            return;
        }
    };

    'connect: while !*shutdown.borrow() {
        info!(state = ?LifecycleState::Dialing, "dialing coordinator");
        let Some(connection) = dial_with_backoff(server_addr, &state, &mut attempt, &mut shutdown).await else {
            break 'connect;
        };

        info!(state = ?LifecycleState::Registering, "registering");
        let response = match tokio::time::timeout(REGISTER_TIMEOUT, register(&connection, &state)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(AgentError::IncompatibleProtocol(min))) => {
                error!(minimum = %min, "coordinator requires a newer protocol version, stopping");
                break 'connect;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "registration failed, retrying");
                attempt += 1;
                continue 'connect;
            }
            Err(_) => {
                warn!("register RPC timed out, retrying");
                attempt += 1;
                continue 'connect;
            }
        };
        attempt = 0;

        info!(state = ?LifecycleState::InterfaceUp, "configuring virtual interface");
        if let Err(e) = bring_interface_up(&state, &response).await {
            error!(error = %e, "failed to configure virtual interface, retrying");
            continue 'connect;
        }

        let mut rules = Vec::new();
        if state.config.mode == AgentMode::Client {
            info!(state = ?LifecycleState::Routing, "installing client routes");
            match fetch_and_install_routes(&connection, &state).await {
                Ok(fetched) => rules = fetched,
                Err(e) => warn!(error = %e, "fetching routes failed, proceeding without forwarding rules"),
            }
        }

        info!(state = ?LifecycleState::Relaying, "relaying");
        run_connection(&connection, &state, &response, rules, &mut shutdown).await;

        info!(state = ?LifecycleState::Rebuilding, "connection ended, rebuilding");
        connection.close(0u32.into(), b"rebuilding");
    }

    info!(state = ?LifecycleState::Stopped, "shutting down, cleaning up in reverse order");
    if let Err(e) = state.routes.cleanup_all().await {
        warn!(error = %e, "route cleanup failed");
    }
    if let Err(e) = state.iface.close().await {
        warn!(error = %e, "interface close failed");
    }
}

fn resolve_server(server: &str) -> Result<SocketAddr> {
    server
        .parse()
        .or_else(|_| {
            use std::net::ToSocketAddrs;
            server.to_socket_addrs().ok().and_then(|mut it| it.next()).ok_or(())
        })
        .map_err(|_| AgentError::Config(format!("cannot resolve server address {server}")))
}

/// Step 1: dial with exponential backoff and jitter, cap ≈ 60s,
/// cancellable on shutdown. Returns `None` if shutdown fired first.
async fn dial_with_backoff(
    server_addr: SocketAddr,
    state: &AgentState,
    attempt: &mut u32,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Connection> {
    loop {
        if *attempt > 0 {
            let backoff = backoff_delay(*attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return None,
            }
            if *shutdown.borrow() {
                return None;
            }
        }

        let server_host = state.config.server.split(':').next().unwrap_or("localhost").to_string();
        let dial_fut = transport::dial(server_addr, &server_host, state.config.insecure_skip_verify);
        tokio::select! {
            result = dial_fut => match result {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    *attempt += 1;
                    warn!(error = %e, attempt = *attempt, "dial failed");
                }
            },
            _ = shutdown.changed() => return None,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = MIN_BACKOFF.saturating_mul(1u32 << attempt.min(8));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_cap = (capped.as_millis() as u64 / 4).max(1);
    let jitter_ms = rand::thread_rng().gen_range(0..=jitter_cap);
    capped + Duration::from_millis(jitter_ms)
}

/// Step 2: Register via RPC on a fresh bidirectional stream.
async fn register(connection: &Connection, state: &AgentState) -> Result<RegisterResponse> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(|e| AgentError::Stream(e.to_string()))?;
    write_stream_kind(&mut send, StreamKind::Register).await?;

    let request = RegisterRequest {
        agent_id: state.agent_id.clone(),
        // `config::validate` guarantees `user_key` is set for client
        // mode; gateway mode doesn't require one (§6), hence the
        // fallback rather than an `unwrap`.
        api_key: state.config.user_key.clone().unwrap_or_default(),
        agent_type: match state.config.mode {
            AgentMode::Client => AgentType::Client,
            AgentMode::Gateway => AgentType::Gateway,
        },
        protocol_version: SUPPORTED_PROTOCOL_VERSIONS[0].to_string(),
        bandwidth: state.config.bandwidth,
        metadata: local_metadata(),
    };
    write_frame(&mut send, &request).await?;
    let _ = send.finish();

    let response: RegisterResponse = read_frame(&mut recv).await?;
    if !response.accepted {
        let message = response.error_message.unwrap_or_default();
        if message == "incompatible" {
            return Err(AgentError::IncompatibleProtocol(response.minimum_supported_version));
        }
        return Err(AgentError::RegistrationRejected(message));
    }
    Ok(response)
}

fn local_metadata() -> tunnel_protocol::model::AgentMetadata {
    tunnel_protocol::model::AgentMetadata {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
    }
}

/// Step 3: configure the virtual interface from the server's response.
async fn bring_interface_up(state: &AgentState, response: &RegisterResponse) -> Result<()> {
    let assigned_ip = response
        .assigned_ip
        .as_deref()
        .and_then(|s| Ipv4Addr::from_str(s).ok())
        .ok_or_else(|| AgentError::Interface("register response missing assigned_ip".to_string()))?;
    let server_config = response
        .server_config
        .as_ref()
        .ok_or_else(|| AgentError::Interface("register response missing server_config".to_string()))?;
    let netmask = Ipv4Addr::from_str(&server_config.netmask)
        .map_err(|_| AgentError::Interface(format!("invalid netmask {}", server_config.netmask)))?;

    state.iface.set_ip(assigned_ip, netmask).await?;
    state.iface.set_mtu(server_config.mtu).await?;
    state.iface.up().await?;
    Ok(())
}

/// Step 4 (client only): fetch the rule set via `GetRoutes` and install
/// OS-level routes for `forward`/`direct` rules. `deny` rules are not
/// enforced at the OS level (§9 Open Question — logged only).
async fn fetch_and_install_routes(connection: &Connection, state: &AgentState) -> Result<Vec<WireRule>> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(|e| AgentError::Stream(e.to_string()))?;
    write_stream_kind(&mut send, StreamKind::GetRoutes).await?;
    write_frame(&mut send, &GetRoutesRequest { agent_id: state.agent_id.clone() }).await?;
    let _ = send.finish();

    let response: GetRoutesResponse = read_frame(&mut recv).await?;
    let mut rules = response.rules;
    rules.sort_by_key(|r| r.priority);

    for rule in rules.iter().filter(|r| r.enabled) {
        match rule.action {
            RuleAction::Forward => {
                if let Err(e) = state.routes.add(&rule.destination, None, state.iface.name()).await {
                    warn!(error = %e, destination = %rule.destination, "failed to install forward route");
                }
            }
            RuleAction::Direct => {}
            RuleAction::Deny => {
                warn!(destination = %rule.destination, "deny rule has no enforcement hook, logged only");
            }
        }
    }
    Ok(rules)
}

/// Steps 5 + 6: open the heartbeat and relay streams and run them
/// concurrently; whichever finishes first (error, or the other half
/// closing) tears down both, per step 7's "close the relay and
/// heartbeat streams" on the `Relaying → Rebuilding` transition.
async fn run_connection(
    connection: &Connection,
    state: &AgentState,
    response: &RegisterResponse,
    rules: Vec<WireRule>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let session_id = response.session_id.clone().unwrap_or_default();
    let keepalive_interval = response.server_config.as_ref().map(|c| c.keepalive_interval).unwrap_or(30);
    let counters = Arc::new(Counters::default());

    let mut heartbeat = tokio::spawn(heartbeat_loop(connection.clone(), session_id.clone(), counters.clone(), keepalive_interval));
    let mut relay = tokio::spawn(relay_loop(connection.clone(), state.clone(), session_id, rules, counters));

    tokio::select! {
        _ = shutdown.changed() => {}
        _ = &mut heartbeat => {}
        _ = &mut relay => {}
    }
    heartbeat.abort();
    relay.abort();
}

async fn heartbeat_loop(connection: Connection, session_id: String, counters: Arc<Counters>, interval_secs: u32) {
    let (mut send, mut recv) = match connection.open_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            warn!(error = %e, "failed to open heartbeat stream");
            return;
        }
    };
    if write_stream_kind(&mut send, StreamKind::Heartbeat).await.is_err() {
        return;
    }

    let interval = Duration::from_secs(interval_secs.max(1) as u64);
    loop {
        tokio::time::sleep(interval).await;
        let request = HeartbeatRequest {
            session_id: session_id.clone(),
            timestamp: unix_timestamp(),
            stats: counters.snapshot(),
        };
        if write_frame(&mut send, &request).await.is_err() {
            warn!("heartbeat send failed, transitioning to rebuilding");
            return;
        }
        match read_frame::<_, HeartbeatResponse>(&mut recv).await {
            Ok(r) if r.alive => {}
            _ => {
                warn!("heartbeat echo failed or not alive, transitioning to rebuilding");
                return;
            }
        }
    }
}

async fn relay_loop(connection: Connection, state: AgentState, session_id: String, rules: Vec<WireRule>, counters: Arc<Counters>) {
    let (mut send, recv) = match connection.open_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            warn!(error = %e, "failed to open relay stream");
            return;
        }
    };
    if write_stream_kind(&mut send, StreamKind::RelayData).await.is_err() {
        return;
    }
    let identify = DataPacket::identify(session_id.clone(), state.agent_id.clone());
    if write_frame(&mut send, &identify).await.is_err() {
        return;
    }

    let mut uplink = tokio::spawn(uplink_loop(state.clone(), send, session_id, rules, counters.clone()));
    let mut downlink = tokio::spawn(downlink_loop(state, recv, counters));

    tokio::select! {
        _ = &mut uplink => {}
        _ = &mut downlink => {}
    }
    uplink.abort();
    downlink.abort();
}

/// Uplink half: reads IP datagrams off the virtual interface and wraps
/// each as a `DataPacket` on the relay stream.
async fn uplink_loop(state: AgentState, mut send: SendStream, session_id: String, rules: Vec<WireRule>, counters: Arc<Counters>) {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    loop {
        let n = match state.iface.read(&mut buf).await {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "virtual interface read failed");
                return;
            }
        };

        let destination_agent_id = parse_ipv4_dest(&buf[..n]).and_then(|dest| select_destination(&rules, dest));

        let packet = DataPacket {
            session_id: session_id.clone(),
            source_agent_id: state.agent_id.clone(),
            destination_agent_id,
            payload: buf[..n].to_vec(),
        };
        if write_frame(&mut send, &packet).await.is_err() {
            warn!("relay uplink write failed");
            return;
        }
        counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        counters.packets_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// Downlink half: receives `DataPacket`s from the relay stream and
/// writes the payload into the virtual interface.
async fn downlink_loop(state: AgentState, mut recv: RecvStream, counters: Arc<Counters>) {
    loop {
        let packet: DataPacket = match read_frame(&mut recv).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "relay downlink read failed");
                return;
            }
        };
        match state.iface.write(&packet.payload).await {
            Ok(n) => {
                counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                counters.packets_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(error = %e, "virtual interface write failed, dropping packet");
                counters.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_ipv4_dest(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Picks the highest-priority enabled `forward` rule whose destination
/// CIDR contains `dest`, returning the gateway agent id to route
/// through. `direct`/`deny` rules never produce a destination override
/// — traffic they match falls back to the coordinator's default
/// any-gateway policy (§4.2.3) if nothing else claims it.
fn select_destination(rules: &[WireRule], dest: Ipv4Addr) -> Option<String> {
    rules
        .iter()
        .filter(|r| r.enabled && r.action == RuleAction::Forward)
        .filter(|r| cidr_contains(&r.destination, dest))
        .min_by_key(|r| r.priority)
        .and_then(|r| r.gateway_id.clone())
}

fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    let Some((addr_part, prefix_part)) = cidr.split_once('/') else { return false };
    let Ok(network_addr) = Ipv4Addr::from_str(addr_part) else { return false };
    let Ok(prefix) = prefix_part.parse::<u32>() else { return false };
    if prefix > 32 {
        return false;
    }
    let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    u32::from(ip) & mask == u32::from(network_addr) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(destination: &str, priority: i32, gateway_id: &str) -> WireRule {
        WireRule {
            rule_id: 1,
            action: RuleAction::Forward,
            destination: destination.to_string(),
            gateway_id: Some(gateway_id.to_string()),
            priority,
            enabled: true,
        }
    }

    #[test]
    fn cidr_contains_matches_within_block_only() {
        assert!(cidr_contains("10.1.0.0/16", Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!cidr_contains("10.1.0.0/16", Ipv4Addr::new(10, 2, 0, 1)));
    }

    #[test]
    fn select_destination_prefers_lower_priority_number() {
        let rules = vec![rule("10.1.0.0/16", 10, "gw-low-priority"), rule("10.1.0.0/24", 1, "gw-high-priority")];
        let chosen = select_destination(&rules, Ipv4Addr::new(10, 1, 0, 5));
        assert_eq!(chosen.as_deref(), Some("gw-high-priority"));
    }

    #[test]
    fn select_destination_ignores_disabled_rules() {
        let mut rules = vec![rule("10.1.0.0/16", 1, "gw")];
        rules[0].enabled = false;
        assert_eq!(select_destination(&rules, Ipv4Addr::new(10, 1, 0, 5)), None);
    }

    #[test]
    fn parse_ipv4_dest_rejects_short_or_non_v4_buffers() {
        assert_eq!(parse_ipv4_dest(&[0u8; 10]), None);
        let mut buf = vec![0u8; 20];
        buf[0] = 0x60; // IPv6 version nibble
        assert_eq!(parse_ipv4_dest(&buf), None);
    }

    #[test]
    fn backoff_delay_is_capped_and_grows() {
        let early = backoff_delay(1);
        let late = backoff_delay(20);
        assert!(early < late);
        assert!(late <= MAX_BACKOFF + Duration::from_millis(MAX_BACKOFF.as_millis() as u64 / 4 + 1));
    }
}

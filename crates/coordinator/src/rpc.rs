//! Coordinator session router (§4.2): accepts `quinn` connections, reads
//! the [`StreamKind`] header off each freshly opened bidirectional
//! stream, and dispatches to the matching RPC handler. Mirrors the
//! teacher's `handlers.rs` connection-task shape (inbound loop,
//! per-stream task, cleanup on disconnect) generalized from one
//! WebSocket per peer to one `quinn::Connection` carrying many streams.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnel_protocol::messages::{
    DataPacket, GetRoutesRequest, GetRoutesResponse, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, ServerConfig as WireServerConfig, StreamKind,
    UpdateStatusRequest, UpdateStatusResponse, WireRule, MINIMUM_SUPPORTED_VERSION, SERVER_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use tunnel_protocol::model::{Agent, AgentMetadata, AgentStatus, AgentType};
use tunnel_protocol::wire::{read_frame, read_stream_kind, write_frame};

use crate::error::CoordinatorError;
use crate::repository::AuditEntry;
use crate::session::{DeliveryOutcome, LiveSession, Mailbox, NewSession};
use crate::state::AppState;

/// Accepts connections on `endpoint` until the process is asked to
/// stop, spawning one task per connection.
pub async fn serve(endpoint: Endpoint, state: AppState) {
    while let Some(incoming) = endpoint.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => handle_connection(conn, state).await,
                Err(e) => warn!(error = %e, "connection handshake failed"),
            }
        });
    }
}

async fn handle_connection(conn: Connection, state: AppState) {
    let peer = conn.remote_address();
    debug!(%peer, "connection established");
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, state, peer).await {
                        debug!(%peer, error = %e, "stream ended");
                    }
                });
            }
            Err(_) => break,
        }
    }
    debug!(%peer, "connection closed");
}

async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    state: AppState,
    peer: SocketAddr,
) -> Result<(), CoordinatorError> {
    let kind = read_stream_kind(&mut recv).await?;
    match kind {
        StreamKind::Register => handle_register_stream(send, recv, state, peer).await,
        StreamKind::Heartbeat => handle_heartbeat_stream(send, recv, state).await,
        StreamKind::RelayData => handle_relay_stream(send, recv, state).await,
        StreamKind::GetRoutes => handle_get_routes_stream(send, recv, state).await,
        StreamKind::UpdateStatus => handle_update_status_stream(send, recv, state).await,
    }
}

// ─── Register (§4.2.1) ──────────────────────────────────────────

async fn handle_register_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    state: AppState,
    peer: SocketAddr,
) -> Result<(), CoordinatorError> {
    let request: RegisterRequest = read_frame(&mut recv).await?;
    let response = process_register(&state, request, peer).await;
    write_frame(&mut send, &response).await?;
    let _ = send.finish();
    Ok(())
}

async fn process_register(state: &AppState, req: RegisterRequest, peer: SocketAddr) -> RegisterResponse {
    match try_register(state, req, peer).await {
        Ok(resp) => resp,
        Err(e) => register_error_response(e),
    }
}

/// Maps a [`CoordinatorError`] to the wire `accepted=false` shape (§7:
/// "RPC handlers map `CoordinatorError` variants to the wire
/// `accepted=false` / stream-close-with-reason shapes"). `incompatible`
/// keeps its own literal `error_message` since agents pattern-match on
/// it to distinguish a hard protocol-version failure from a retryable one.
fn register_error_response(err: CoordinatorError) -> RegisterResponse {
    match err {
        CoordinatorError::IncompatibleProtocol(_) => RegisterResponse::incompatible(),
        other => RegisterResponse::error(other.to_string()),
    }
}

async fn try_register(
    state: &AppState,
    req: RegisterRequest,
    peer: SocketAddr,
) -> Result<RegisterResponse, CoordinatorError> {
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&req.protocol_version.as_str()) {
        warn!(agent_id = %req.agent_id, version = %req.protocol_version, "incompatible protocol version");
        return Err(CoordinatorError::IncompatibleProtocol(req.protocol_version.clone()));
    }

    let user = match state.repository.get_user_by_api_key(&req.api_key).await {
        Ok(u) if u.status.is_active() => u,
        Ok(_) => return Err(CoordinatorError::Unauthenticated("user suspended or disabled".to_string())),
        Err(_) => return Err(CoordinatorError::Unauthenticated("bad api key".to_string())),
    };

    let existing_agent = state.repository.get_agent(&req.agent_id).await.ok();

    let assigned_ip = match &existing_agent {
        Some(agent) if agent.user_id != user.id => {
            warn!(agent_id = %req.agent_id, "agent owned by a different user");
            return Err(CoordinatorError::PermissionDenied(format!(
                "agent {} is already owned by a different user",
                req.agent_id
            )));
        }
        Some(agent) => match &agent.overlay_ip {
            Some(ip_str) => match ip_str.parse() {
                Ok(ip) => {
                    if state.pool.get(&req.agent_id).is_none() {
                        // Coordinator just started: repopulate the pool
                        // from the persisted record (§3 Address
                        // Allocation lifecycle).
                        let _ = state.pool.allocate_specific(&req.agent_id, ip);
                    }
                    ip
                }
                Err(_) => state.pool.allocate(&req.agent_id).map_err(|_| CoordinatorError::Exhausted)?,
            },
            None => state.pool.allocate(&req.agent_id).map_err(|_| CoordinatorError::Exhausted)?,
        },
        None => state.pool.allocate(&req.agent_id).map_err(|_| CoordinatorError::Exhausted)?,
    };

    let agent = Agent {
        id: req.agent_id.clone(),
        user_id: user.id.clone(),
        agent_type: req.agent_type,
        overlay_ip: Some(assigned_ip.to_string()),
        status: AgentStatus::Online,
        last_heartbeat: Some(chrono::Utc::now()),
        bandwidth_limit: if req.bandwidth == 0 { None } else { Some(req.bandwidth) },
        metadata: req.metadata,
    };
    state.repository.create_agent(&agent).await.map_err(|e| {
        warn!(agent_id = %req.agent_id, error = %e, "failed to persist agent record");
        CoordinatorError::Repository(e.to_string())
    })?;

    let session_id = Uuid::new_v4().to_string();
    let connection_id = Uuid::new_v4().to_string();

    let session_row = tunnel_protocol::model::Session {
        id: session_id.clone(),
        agent_id: req.agent_id.clone(),
        connection_id: connection_id.clone(),
        created_at: chrono::Utc::now(),
        last_activity: chrono::Utc::now(),
        bytes_sent: 0,
        bytes_received: 0,
    };
    state.repository.create_session(&session_row).await.map_err(|e| {
        warn!(agent_id = %req.agent_id, error = %e, "failed to persist session record");
        CoordinatorError::Repository(e.to_string())
    })?;

    // Installing the new session atomically aborts and replaces any
    // prior live session for this agent id before we return below
    // (§4.2.1 step 4, §5 ordering guarantee (c)).
    let (_session, previous) = state.sessions.insert(
        NewSession {
            session_id: session_id.clone(),
            agent_id: req.agent_id.clone(),
            user_id: user.id.clone(),
            agent_type: req.agent_type,
            connection_id,
        }
        .into(),
    );
    if let Some(previous) = previous {
        info!(agent_id = %req.agent_id, old_session = %previous.session_id, "re-registration preempted prior session");
    }

    let _ = state
        .repository
        .record_audit_log(AuditEntry {
            user_id: Some(user.id.clone()),
            agent_id: Some(req.agent_id.clone()),
            action: "register".to_string(),
            resource_type: "agent".to_string(),
            resource_id: req.agent_id.clone(),
            ip_address: Some(peer.to_string()),
            status: "success".to_string(),
            details: serde_json::json!({ "assigned_ip": assigned_ip.to_string() }),
        })
        .await;

    info!(agent_id = %req.agent_id, %assigned_ip, session_id = %session_id, "agent registered");

    Ok(RegisterResponse {
        accepted: true,
        session_id: Some(session_id),
        assigned_ip: Some(assigned_ip.to_string()),
        server_version: SERVER_VERSION.to_string(),
        minimum_supported_version: MINIMUM_SUPPORTED_VERSION.to_string(),
        server_config: Some(WireServerConfig {
            gateway_ip: state.pool.gateway_ip().to_string(),
            netmask: state.pool.netmask().to_string(),
            mtu: state.network.mtu,
            keepalive_interval: state.network.keepalive_interval,
            keepalive_timeout: state.network.keepalive_timeout,
        }),
        error_message: None,
    })
}

// ─── Heartbeat (§4.2.2) ─────────────────────────────────────────

async fn handle_heartbeat_stream(mut send: SendStream, mut recv: RecvStream, state: AppState) -> Result<(), CoordinatorError> {
    let first: HeartbeatRequest = read_frame(&mut recv).await?;
    let Some(session) = state.sessions.get(&first.session_id) else {
        return Ok(());
    };

    apply_heartbeat(&state, &session, &first).await;
    write_frame(&mut send, &HeartbeatResponse { alive: true, timestamp: first.timestamp }).await?;

    let inner = tokio::spawn(heartbeat_loop(send, recv, state.clone(), session.clone()));
    session.register_task(inner.abort_handle());
    let _ = inner.await;
    Ok(())
}

async fn heartbeat_loop(mut send: SendStream, mut recv: RecvStream, state: AppState, session: Arc<LiveSession>) {
    loop {
        match read_frame::<_, HeartbeatRequest>(&mut recv).await {
            Ok(req) => {
                apply_heartbeat(&state, &session, &req).await;
                if write_frame(&mut send, &HeartbeatResponse { alive: true, timestamp: req.timestamp })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    terminate_session(&state, &session).await;
}

async fn apply_heartbeat(state: &AppState, session: &Arc<LiveSession>, req: &HeartbeatRequest) {
    session.touch();
    session.bytes_sent.store(req.stats.bytes_sent, Ordering::Relaxed);
    session.bytes_received.store(req.stats.bytes_received, Ordering::Relaxed);
    let _ = state
        .repository
        .update_session_stats(&session.session_id, req.stats.bytes_sent, req.stats.bytes_received)
        .await;
}

// ─── RelayData (§4.2.3) ─────────────────────────────────────────

async fn handle_relay_stream(mut send: SendStream, mut recv: RecvStream, state: AppState) -> Result<(), CoordinatorError> {
    let first: DataPacket = read_frame(&mut recv).await?;
    let Some(session) = state.sessions.get(&first.session_id) else {
        // §4.2.3: "on miss closes with NotFound".
        let err = CoordinatorError::NotFound(format!("session {}", first.session_id));
        debug!(error = %err, "relay stream identify failed");
        send.reset(quinn::VarInt::from_u32(1)).ok();
        return Ok(());
    };
    if session.agent_id != first.source_agent_id {
        let err = CoordinatorError::PermissionDenied(format!(
            "stream claims agent {} but session belongs to {}",
            first.source_agent_id, session.agent_id
        ));
        warn!(error = %err, "relay stream identify mismatch");
        send.reset(quinn::VarInt::from_u32(1)).ok();
        return Ok(());
    }

    let mailbox = session.open_relay_mailbox();

    let reader = tokio::spawn(relay_inbound_loop(recv, state.clone(), session.clone()));
    let writer = tokio::spawn(relay_outbound_loop(send, mailbox, session.clone()));
    session.register_task(reader.abort_handle());
    session.register_task(writer.abort_handle());

    let _ = tokio::join!(reader, writer);
    session.clear_relay_mailbox();
    terminate_session(&state, &session).await;
    Ok(())
}

async fn relay_inbound_loop(mut recv: RecvStream, state: AppState, source: Arc<LiveSession>) {
    loop {
        match read_frame::<_, DataPacket>(&mut recv).await {
            Ok(packet) => {
                source.touch();
                source.bytes_received.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
                dispatch_packet(&state, &source, packet);
            }
            Err(_) => break,
        }
    }
}

async fn relay_outbound_loop(mut send: SendStream, mailbox: Arc<Mailbox>, session: Arc<LiveSession>) {
    loop {
        let packet = mailbox.recv().await;
        let len = packet.payload.len() as u64;
        if write_frame(&mut send, &packet).await.is_err() {
            break;
        }
        session.bytes_sent.fetch_add(len, Ordering::Relaxed);
    }
}

/// Routes one inbound `DataPacket` to its destination session's
/// mailbox (§4.2.3 Dispatch rule). Never blocks and never tears down
/// the source session — an undeliverable packet is dropped and counted.
fn dispatch_packet(state: &AppState, source: &Arc<LiveSession>, packet: DataPacket) {
    let destination = match &packet.destination_agent_id {
        Some(dest_id) => state.sessions.get_by_agent_id(dest_id),
        None => state.sessions.live_gateways_for_user(&source.user_id).into_iter().next(),
    };

    match destination {
        Some(dest) => match dest.try_deliver(packet) {
            DeliveryOutcome::Delivered | DeliveryOutcome::Dropped => {}
            DeliveryOutcome::NoRelayStream => {
                source.drops.fetch_add(1, Ordering::Relaxed);
            }
        },
        None => {
            source.drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─── GetRoutes (§4.2.4) ─────────────────────────────────────────

async fn handle_get_routes_stream(mut send: SendStream, mut recv: RecvStream, state: AppState) -> Result<(), CoordinatorError> {
    let request: GetRoutesRequest = read_frame(&mut recv).await?;
    let response = process_get_routes(&state, request).await;
    write_frame(&mut send, &response).await?;
    let _ = send.finish();
    Ok(())
}

async fn process_get_routes(state: &AppState, req: GetRoutesRequest) -> GetRoutesResponse {
    let rules = state
        .repository
        .list_routing_rules_for_agent(&req.agent_id)
        .await
        .unwrap_or_default();
    GetRoutesResponse {
        rules: rules
            .into_iter()
            .map(|r| WireRule {
                rule_id: r.id,
                action: r.action,
                destination: r.destination,
                gateway_id: r.gateway_id,
                priority: r.priority,
                enabled: r.enabled,
            })
            .collect(),
    }
}

// ─── UpdateStatus (§4.2.5) ──────────────────────────────────────

async fn handle_update_status_stream(mut send: SendStream, mut recv: RecvStream, state: AppState) -> Result<(), CoordinatorError> {
    let request: UpdateStatusRequest = read_frame(&mut recv).await?;
    let response = process_update_status(&state, request).await;
    write_frame(&mut send, &response).await?;
    let _ = send.finish();
    Ok(())
}

async fn process_update_status(state: &AppState, req: UpdateStatusRequest) -> UpdateStatusResponse {
    match state.repository.update_agent_status(&req.agent_id, req.status).await {
        Ok(()) => {
            let _ = state
                .repository
                .record_audit_log(AuditEntry {
                    user_id: None,
                    agent_id: Some(req.agent_id.clone()),
                    action: "update_status".to_string(),
                    resource_type: "agent".to_string(),
                    resource_id: req.agent_id,
                    ip_address: None,
                    status: "success".to_string(),
                    details: serde_json::json!({ "status": format!("{:?}", req.status) }),
                })
                .await;
            UpdateStatusResponse { acknowledged: true, message: None }
        }
        Err(e) => UpdateStatusResponse { acknowledged: false, message: Some(e.to_string()) },
    }
}

// ─── Session termination (§4.2.6) ───────────────────────────────

/// Removes `session` from the live table if it is still the one
/// installed for its agent id, marks the agent offline, and aborts any
/// sibling stream tasks (heartbeat/relay) still running for it. A
/// no-op if the session was already superseded by a newer registration
/// (avoids clobbering a freshly re-registered agent's `online` status).
async fn terminate_session(state: &AppState, session: &Arc<LiveSession>) {
    if state.sessions.remove(&session.session_id).is_some() {
        session.abort_tasks();
        let _ = state.repository.update_agent_status(&session.agent_id, AgentStatus::Offline).await;
        let _ = state.repository.delete_session(&session.session_id).await;
        let _ = state
            .repository
            .record_audit_log(AuditEntry {
                user_id: Some(session.user_id.clone()),
                agent_id: Some(session.agent_id.clone()),
                action: "session_delete".to_string(),
                resource_type: "session".to_string(),
                resource_id: session.session_id.clone(),
                ip_address: None,
                status: "success".to_string(),
                details: serde_json::json!({}),
            })
            .await;
        info!(agent_id = %session.agent_id, session_id = %session.session_id, "session terminated");
    }
}

/// Background sweep removing sessions whose last heartbeat predates the
/// configured `keepalive_timeout` (§5 Cancellation & timeouts).
pub async fn run_heartbeat_reaper(state: AppState) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
    loop {
        ticker.tick().await;
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(state.network.keepalive_timeout as i64);
        for session in state.sessions.stale_sessions(cutoff) {
            warn!(agent_id = %session.agent_id, session_id = %session.session_id, "heartbeat timeout");
            terminate_session(&state, &session).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AddressPool;
    use crate::repository::memory::InMemoryRepository;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use tunnel_protocol::config::NetworkConfig;
    use tunnel_protocol::model::{RuleAction, RoutingRule, User, UserStatus};

    fn test_state_with(repo: Arc<InMemoryRepository>) -> AppState {
        let pool = AddressPool::new("10.200.0.0/16").unwrap();
        AppState::new(
            pool,
            repo,
            NetworkConfig {
                overlay_cidr: "10.200.0.0/16".into(),
                gateway_ip: "10.200.0.1".into(),
                mtu: 1400,
                keepalive_interval: 30,
                keepalive_timeout: 90,
            },
        )
    }

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999)
    }

    fn register_request(agent_id: &str, api_key: &str, agent_type: AgentType) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            api_key: api_key.to_string(),
            agent_type,
            protocol_version: "1.0.0".to_string(),
            bandwidth: 0,
            metadata: AgentMetadata::default(),
        }
    }

    #[tokio::test]
    async fn cold_start_single_client_single_gateway_get_sequential_ips() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo);

        let gw = process_register(&state, register_request("G", "key1", AgentType::Gateway), peer()).await;
        assert!(gw.accepted);
        assert_eq!(gw.assigned_ip.as_deref(), Some("10.200.0.2"));

        let client = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;
        assert!(client.accepted);
        assert_eq!(client.assigned_ip.as_deref(), Some("10.200.0.3"));
    }

    #[tokio::test]
    async fn reregistration_preempts_prior_session_and_keeps_ip() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo);

        let first = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;
        let second = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.assigned_ip, second.assigned_ip);
        assert!(state.sessions.get(&first.session_id.unwrap()).is_none());
        assert!(state.sessions.get(&second.session_id.unwrap()).is_some());
    }

    #[tokio::test]
    async fn protocol_mismatch_is_rejected_without_side_effects() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo);
        let mut req = register_request("C", "key1", AgentType::Client);
        req.protocol_version = "0.9.0".to_string();

        let resp = process_register(&state, req, peer()).await;
        assert!(!resp.accepted);
        assert_eq!(resp.error_message.as_deref(), Some("incompatible"));
        assert!(state.repository.get_agent("C").await.is_err());
        assert_eq!(state.pool.allocated_count(), 0);
    }

    #[tokio::test]
    async fn exhaustion_then_release_then_success() {
        let pool = AddressPool::new("10.0.0.0/30").unwrap();
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = AppState::new(
            pool,
            repo,
            NetworkConfig {
                overlay_cidr: "10.0.0.0/30".into(),
                gateway_ip: "10.0.0.1".into(),
                mtu: 1400,
                keepalive_interval: 30,
                keepalive_timeout: 90,
            },
        );

        let a = process_register(&state, register_request("A", "key1", AgentType::Client), peer()).await;
        assert!(a.accepted);
        let b = process_register(&state, register_request("B", "key1", AgentType::Client), peer()).await;
        assert!(!b.accepted);

        state.pool.release("A").unwrap();
        let b2 = process_register(&state, register_request("B", "key1", AgentType::Client), peer()).await;
        assert!(b2.accepted);
        assert_eq!(b2.assigned_ip, a.assigned_ip);
    }

    #[tokio::test]
    async fn get_routes_is_sorted_and_enabled_only() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_routing_rule(RoutingRule {
            id: 1,
            agent_id: "C".into(),
            action: RuleAction::Forward,
            destination: "10.0.0.0/8".into(),
            gateway_id: Some("G".into()),
            priority: 50,
            enabled: true,
        });
        repo.seed_routing_rule(RoutingRule {
            id: 2,
            agent_id: "C".into(),
            action: RuleAction::Direct,
            destination: "192.168.1.0/24".into(),
            gateway_id: None,
            priority: 10,
            enabled: true,
        });
        let state = test_state_with(repo);

        let resp = process_get_routes(&state, GetRoutesRequest { agent_id: "C".into() }).await;
        assert_eq!(resp.rules.len(), 2);
        assert_eq!(resp.rules[0].priority, 10);
        assert_eq!(resp.rules[1].priority, 50);
    }

    #[tokio::test]
    async fn dispatch_with_no_matching_gateway_drops_and_counts_on_source() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo);
        let client = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;
        let session = state.sessions.get(&client.session_id.unwrap()).unwrap();

        dispatch_packet(&state, &session, DataPacket::identify("s", "C"));
        assert_eq!(session.drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn back_pressure_drops_on_destination_never_blocks_source() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo);
        let gw_resp = process_register(&state, register_request("G", "key1", AgentType::Gateway), peer()).await;
        let gw_session = state.sessions.get(&gw_resp.session_id.unwrap()).unwrap();
        gw_session.open_relay_mailbox_with_capacity(1);

        let client_resp = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;
        let client_session = state.sessions.get(&client_resp.session_id.unwrap()).unwrap();

        for _ in 0..10 {
            dispatch_packet(&state, &client_session, DataPacket::identify("s", "C"));
        }
        assert!(gw_session.drops.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn terminate_session_records_a_session_delete_audit_log() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user(User { id: "u1".into(), api_key: "key1".into(), status: UserStatus::Active });
        let state = test_state_with(repo.clone());
        let resp = process_register(&state, register_request("C", "key1", AgentType::Client), peer()).await;
        let session = state.sessions.get(&resp.session_id.unwrap()).unwrap();

        terminate_session(&state, &session).await;

        let actions = repo.audit_log_actions();
        assert!(actions.contains(&"register".to_string()));
        assert!(actions.contains(&"session_delete".to_string()));
    }
}

//! Session table (§3 Session, §4.2, §5). Owns the live, in-memory
//! mapping from session id to connection state; the repository owns the
//! corresponding persistent row. A `DashMap` gives the "many concurrent
//! readers, point writes" access pattern the router's dispatch path
//! needs without a single process-wide lock (the teacher's `state.rs`
//! uses the same type for its agent/connection registries).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tunnel_protocol::messages::DataPacket;
use tunnel_protocol::model::AgentType;

/// Bound on a destination session's outgoing packet mailbox. Dispatch
/// is a non-blocking enqueue; when full, the router tail-drops the
/// oldest queued packet rather than blocking other sessions (§4.2.3,
/// Design Notes §9).
pub const RELAY_MAILBOX_CAPACITY: usize = 256;

/// Bounded FIFO of outgoing packets for one session's relay stream.
/// `push` is the non-blocking producer side dispatch uses; once the
/// bound is reached it pops the oldest queued packet before enqueuing
/// the new one, so a slow destination loses history rather than the
/// packet that just arrived (§4.2.3 tail-drop).
pub struct Mailbox {
    queue: std::sync::Mutex<VecDeque<DataPacket>>,
    capacity: usize,
    notify: Notify,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Mailbox {
            queue: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Returns `true` if an older packet was dropped to make room.
    fn push(&self, packet: DataPacket) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let dropped = queue.len() >= self.capacity;
        if dropped {
            queue.pop_front();
        }
        queue.push_back(packet);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    pub async fn recv(&self) -> DataPacket {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.queue.lock().unwrap().pop_front() {
                return packet;
            }
            notified.await;
        }
    }
}

/// One live, authenticated agent connection.
pub struct LiveSession {
    pub session_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub agent_type: AgentType,
    pub connection_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub last_activity: std::sync::Mutex<chrono::DateTime<Utc>>,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub drops: AtomicU64,
    /// This session's relay mailbox; other sessions' dispatch logic
    /// pushes packets here. `None` until the relay stream has opened
    /// and identified itself (§4.2.3).
    relay_mailbox: std::sync::Mutex<Option<Arc<Mailbox>>>,
    /// Handles of the long-lived tasks driving this session's heartbeat
    /// and relay streams. Aborted synchronously on replacement so the
    /// old relay stream is guaranteed closed before a re-`Register`
    /// response is returned (§5 ordering guarantee (c)).
    tasks: std::sync::Mutex<Vec<tokio::task::AbortHandle>>,
}

impl LiveSession {
    pub fn register_task(&self, handle: tokio::task::AbortHandle) {
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Utc::now();
    }

    pub fn last_activity(&self) -> chrono::DateTime<Utc> {
        *self.last_activity.lock().unwrap()
    }

    /// Opens a fresh relay mailbox for this session, replacing any
    /// previous one, and returns the shared handle so the caller's
    /// outbound loop can pull packets as dispatch pushes them in.
    pub fn open_relay_mailbox(&self) -> Arc<Mailbox> {
        self.open_relay_mailbox_with_capacity(RELAY_MAILBOX_CAPACITY)
    }

    pub fn open_relay_mailbox_with_capacity(&self, capacity: usize) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(capacity));
        *self.relay_mailbox.lock().unwrap() = Some(mailbox.clone());
        mailbox
    }

    pub fn clear_relay_mailbox(&self) {
        *self.relay_mailbox.lock().unwrap() = None;
    }

    /// Non-blocking enqueue onto this session's mailbox. Tail-drops the
    /// oldest queued packet when the mailbox is full so a slow
    /// destination never stalls the dispatching task (§4.2.3).
    pub fn try_deliver(&self, packet: DataPacket) -> DeliveryOutcome {
        let guard = self.relay_mailbox.lock().unwrap();
        let Some(mailbox) = guard.as_ref() else {
            return DeliveryOutcome::NoRelayStream;
        };
        if mailbox.push(packet) {
            self.drops.fetch_add(1, Ordering::Relaxed);
            DeliveryOutcome::Dropped
        } else {
            DeliveryOutcome::Delivered
        }
    }
}

pub enum DeliveryOutcome {
    Delivered,
    Dropped,
    NoRelayStream,
}

/// Owns the live session table and its agent-id secondary index for
/// the coordinator process lifetime (§3 Ownership summary).
#[derive(Clone, Default)]
pub struct SessionTable {
    by_session_id: Arc<DashMap<String, Arc<LiveSession>>>,
    by_agent_id: Arc<DashMap<String, String>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh session, replacing and returning any prior live
    /// session for the same agent id (§3 Session invariant: at most one
    /// live session per agent; §4.2.1 step 4, §4.2.6).
    pub fn insert(&self, session: LiveSession) -> (Arc<LiveSession>, Option<Arc<LiveSession>>) {
        let session = Arc::new(session);
        let agent_id = session.agent_id.clone();
        let session_id = session.session_id.clone();

        let previous_session_id = self.by_agent_id.insert(agent_id, session_id.clone());
        let previous = previous_session_id.and_then(|sid| self.remove_by_session_id(&sid));
        if let Some(previous) = &previous {
            previous.abort_tasks();
        }

        self.by_session_id.insert(session_id, session.clone());
        (session, previous)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.by_session_id.get(session_id).map(|e| e.value().clone())
    }

    pub fn get_by_agent_id(&self, agent_id: &str) -> Option<Arc<LiveSession>> {
        let session_id = self.by_agent_id.get(agent_id)?.value().clone();
        self.get(&session_id)
    }

    fn remove_by_session_id(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.by_session_id.remove(session_id).map(|(_, s)| s)
    }

    /// Removes a session by id, also dropping its agent-id index entry
    /// if it still points at this session (it may already have been
    /// replaced by a newer registration).
    pub fn remove(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        let removed = self.remove_by_session_id(session_id)?;
        if let Some(entry) = self.by_agent_id.get(&removed.agent_id) {
            if entry.value() == session_id {
                drop(entry);
                self.by_agent_id.remove(&removed.agent_id);
            }
        }
        Some(removed)
    }

    /// Live gateway sessions owned by `user_id`, ordered deterministically
    /// by agent id ascending (§4.2.3 gateway-selection policy).
    pub fn live_gateways_for_user(&self, user_id: &str) -> Vec<Arc<LiveSession>> {
        let mut out: Vec<Arc<LiveSession>> = self
            .by_session_id
            .iter()
            .filter(|e| e.value().user_id == user_id && e.value().agent_type == AgentType::Gateway)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub fn len(&self) -> usize {
        self.by_session_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session_id.is_empty()
    }

    /// Sessions whose last heartbeat predates `cutoff` — candidates for
    /// liveness-timeout removal (§5 Cancellation & timeouts).
    pub fn stale_sessions(&self, cutoff: chrono::DateTime<Utc>) -> Vec<Arc<LiveSession>> {
        self.by_session_id
            .iter()
            .filter(|e| e.value().last_activity() < cutoff)
            .map(|e| e.value().clone())
            .collect()
    }
}

pub struct NewSession {
    pub session_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub agent_type: AgentType,
    pub connection_id: String,
}

impl From<NewSession> for LiveSession {
    fn from(n: NewSession) -> Self {
        let now = Utc::now();
        LiveSession {
            session_id: n.session_id,
            agent_id: n.agent_id,
            user_id: n.user_id,
            agent_type: n.agent_type,
            connection_id: n.connection_id,
            created_at: now,
            last_activity: std::sync::Mutex::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            relay_mailbox: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(session_id: &str, agent_id: &str, user_id: &str, ty: AgentType) -> LiveSession {
        NewSession {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            agent_type: ty,
            connection_id: "conn-1".to_string(),
        }
        .into()
    }

    #[test]
    fn at_most_one_live_session_per_agent() {
        let table = SessionTable::new();
        table.insert(new_session("s1", "a", "u", AgentType::Client));
        let (_, previous) = table.insert(new_session("s2", "a", "u", AgentType::Client));
        assert!(previous.is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_by_agent_id("a").unwrap().session_id, "s2");
    }

    #[test]
    fn removing_a_superseded_session_id_does_not_clobber_the_new_one() {
        let table = SessionTable::new();
        let (_, _) = table.insert(new_session("s1", "a", "u", AgentType::Client));
        let (_, previous) = table.insert(new_session("s2", "a", "u", AgentType::Client));
        // Simulate the old stream's cleanup task running late.
        table.remove(&previous.unwrap().session_id);
        assert_eq!(table.get_by_agent_id("a").unwrap().session_id, "s2");
    }

    #[test]
    fn gateway_selection_is_deterministic_by_agent_id() {
        let table = SessionTable::new();
        table.insert(new_session("s1", "gw-b", "u", AgentType::Gateway));
        table.insert(new_session("s2", "gw-a", "u", AgentType::Gateway));
        let gateways = table.live_gateways_for_user("u");
        assert_eq!(gateways[0].agent_id, "gw-a");
        assert_eq!(gateways[1].agent_id, "gw-b");
    }

    #[test]
    fn delivery_without_a_relay_stream_reports_no_relay_stream() {
        let table = SessionTable::new();
        let (session, _) = table.insert(new_session("s1", "a", "u", AgentType::Client));
        let outcome = session.try_deliver(DataPacket::identify("s1", "a"));
        assert!(matches!(outcome, DeliveryOutcome::NoRelayStream));
    }

    #[tokio::test]
    async fn full_mailbox_tail_drops_and_counts() {
        let table = SessionTable::new();
        let (session, _) = table.insert(new_session("s1", "a", "u", AgentType::Client));
        let mailbox = session.open_relay_mailbox_with_capacity(1);
        assert!(matches!(
            session.try_deliver(DataPacket::identify("s1", "first")),
            DeliveryOutcome::Delivered
        ));
        assert!(matches!(
            session.try_deliver(DataPacket::identify("s1", "second")),
            DeliveryOutcome::Dropped
        ));
        assert_eq!(session.drops.load(Ordering::Relaxed), 1);

        // Tail-drop: the oldest queued packet ("first") is the one
        // discarded, not the one that just arrived.
        let surviving = mailbox.recv().await;
        assert_eq!(surviving.source_agent_id, "second");
    }
}

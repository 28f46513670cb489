// In-process event bus: named rooms fan events out to connection queues.
//
// Rooms are created on first subscription and dropped when the last
// subscriber leaves. Delivery into a connection queue preserves publish
// order; a full queue closes the connection instead of blocking the
// publisher.
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CONNECTION_QUEUE_SIZE: usize = 256;

/// Closed set of realtime event kinds (server to client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageNew,
    MessageDeleted,
    MessageReactionAdded,
    MessageReactionRemoved,
    MessagePinned,
    MessageUnpinned,
    DmNew,
    DmEncrypted,
    DmReactionAdded,
    DmReactionRemoved,
    DmCleared,
    DmBlocked,
    DmDisappearProposed,
    DmDisappearEnabled,
    DmDisappearDisabled,
    DmExpired,
    MemberJoined,
    MemberLeft,
    MemberRemoved,
    MemberRoleChanged,
    GroupCreated,
    GroupUpdated,
    GroupDeleted,
    GroupPermissionsUpdated,
    AgentOnline,
    AgentOffline,
    TypingStart,
    TypingStop,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageNew => "message:new",
            Self::MessageDeleted => "message:deleted",
            Self::MessageReactionAdded => "message:reaction:added",
            Self::MessageReactionRemoved => "message:reaction:removed",
            Self::MessagePinned => "message:pinned",
            Self::MessageUnpinned => "message:unpinned",
            Self::DmNew => "dm:new",
            Self::DmEncrypted => "dm:encrypted",
            Self::DmReactionAdded => "dm:reaction:added",
            Self::DmReactionRemoved => "dm:reaction:removed",
            Self::DmCleared => "dm:cleared",
            Self::DmBlocked => "dm:blocked",
            Self::DmDisappearProposed => "dm:disappear:proposed",
            Self::DmDisappearEnabled => "dm:disappear:enabled",
            Self::DmDisappearDisabled => "dm:disappear:disabled",
            Self::DmExpired => "dm:expired",
            Self::MemberJoined => "member:joined",
            Self::MemberLeft => "member:left",
            Self::MemberRemoved => "member:removed",
            Self::MemberRoleChanged => "member:roleChanged",
            Self::GroupCreated => "group:created",
            Self::GroupUpdated => "group:updated",
            Self::GroupDeleted => "group:deleted",
            Self::GroupPermissionsUpdated => "group:permissionsUpdated",
            Self::AgentOnline => "agent:online",
            Self::AgentOffline => "agent:offline",
            Self::TypingStart => "typing:start",
            Self::TypingStop => "typing:stop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl RealtimeEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }

    pub fn to_frame(&self) -> Value {
        json!({ "event": self.kind.as_str(), "data": self.data })
    }
}

pub fn group_room(group_id: &str) -> String {
    format!("group:{group_id}")
}

pub fn agent_room(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

pub type ConnectionId = u64;

struct ConnectionEntry {
    agent_id: String,
    sender: mpsc::Sender<RealtimeEvent>,
    cancel: CancellationToken,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct BusState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection queue; the cancellation token is triggered when
    /// the bus decides to drop the connection (queue overflow or receiver
    /// gone).
    pub fn register(
        &self,
        agent_id: &str,
        sender: mpsc::Sender<RealtimeEvent>,
        cancel: CancellationToken,
    ) -> ConnectionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let connection_id = state.next_id;
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                agent_id: agent_id.trim().to_string(),
                sender,
                cancel,
                rooms: HashSet::new(),
            },
        );
        connection_id
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        let mut state = self.state.lock();
        Self::remove_connection(&mut state, connection_id);
    }

    pub fn join_room(&self, connection_id: ConnectionId, room: &str) {
        let room = room.trim();
        if room.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return;
        };
        entry.rooms.insert(room.to_string());
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
    }

    pub fn leave_room(&self, connection_id: ConnectionId, room: &str) {
        let room = room.trim();
        let mut state = self.state.lock();
        if let Some(entry) = state.connections.get_mut(&connection_id) {
            entry.rooms.remove(room);
        }
        let empty = match state.rooms.get_mut(room) {
            Some(members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            state.rooms.remove(room);
        }
    }

    /// Fan an event out to every connection subscribed to `room`.
    pub fn publish(&self, room: &str, event: RealtimeEvent) {
        self.publish_inner(room, None, event);
    }

    /// Same as `publish` but skips one connection (typing events are never
    /// echoed back to the typer).
    pub fn publish_except(&self, room: &str, skip: ConnectionId, event: RealtimeEvent) {
        self.publish_inner(room, Some(skip), event);
    }

    /// Deliver to every registered connection, optionally skipping one
    /// (presence transitions go to all *other* connections).
    pub fn broadcast_all(&self, skip: Option<ConnectionId>, event: RealtimeEvent) {
        let mut state = self.state.lock();
        let targets: Vec<ConnectionId> = state
            .connections
            .keys()
            .copied()
            .filter(|id| Some(*id) != skip)
            .collect();
        self.deliver_to(&mut state, &targets, &event);
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    fn publish_inner(&self, room: &str, skip: Option<ConnectionId>, event: RealtimeEvent) {
        let mut state = self.state.lock();
        let targets: Vec<ConnectionId> = match state.rooms.get(room.trim()) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != skip)
                .collect(),
            None => return,
        };
        self.deliver_to(&mut state, &targets, &event);
    }

    fn deliver_to(&self, state: &mut BusState, targets: &[ConnectionId], event: &RealtimeEvent) {
        let mut dead: Vec<ConnectionId> = Vec::new();
        for connection_id in targets {
            let Some(entry) = state.connections.get(connection_id) else {
                continue;
            };
            match entry.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: close instead of back-pressuring the
                    // publisher.
                    tracing::warn!(
                        agent_id = %entry.agent_id,
                        "realtime queue overflow, closing connection"
                    );
                    dead.push(*connection_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*connection_id);
                }
            }
        }
        for connection_id in dead {
            Self::remove_connection(state, connection_id);
        }
    }

    fn remove_connection(state: &mut BusState, connection_id: ConnectionId) {
        let Some(entry) = state.connections.remove(&connection_id) else {
            return;
        };
        entry.cancel.cancel();
        for room in entry.rooms {
            let empty = match state.rooms.get_mut(&room) {
                Some(members) => {
                    members.remove(&connection_id);
                    members.is_empty()
                }
                None => false,
            };
            if empty {
                state.rooms.remove(&room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(bus: &EventBus, agent: &str) -> (ConnectionId, mpsc::Receiver<RealtimeEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_SIZE);
        let id = bus.register(agent, tx, CancellationToken::new());
        (id, rx)
    }

    #[tokio::test]
    async fn publish_reaches_room_members_in_order() {
        let bus = EventBus::new();
        let (id_a, mut rx_a) = subscribe(&bus, "a");
        let (_id_b, mut rx_b) = subscribe(&bus, "b");
        bus.join_room(id_a, "group:g1");

        bus.publish(
            "group:g1",
            RealtimeEvent::new(EventKind::MessageNew, json!({"seq": 1})),
        );
        bus.publish(
            "group:g1",
            RealtimeEvent::new(EventKind::MessageNew, json!({"seq": 2})),
        );

        let first = rx_a.recv().await.expect("first event");
        let second = rx_a.recv().await.expect("second event");
        assert_eq!(first.data["seq"], 1);
        assert_eq!(second.data["seq"], 2);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_except_skips_the_origin_connection() {
        let bus = EventBus::new();
        let (id_a, mut rx_a) = subscribe(&bus, "a");
        let (id_b, mut rx_b) = subscribe(&bus, "b");
        bus.join_room(id_a, "group:g1");
        bus.join_room(id_b, "group:g1");

        bus.publish_except(
            "group:g1",
            id_a,
            RealtimeEvent::new(EventKind::TypingStart, json!({"agent_id": "a"})),
        );
        assert!(rx_a.try_recv().is_err());
        assert_eq!(
            rx_b.recv().await.expect("typing event").kind,
            EventKind::TypingStart
        );
    }

    #[tokio::test]
    async fn room_is_garbage_collected_when_last_member_leaves() {
        let bus = EventBus::new();
        let (id_a, _rx_a) = subscribe(&bus, "a");
        bus.join_room(id_a, "group:g1");
        assert_eq!(bus.room_size("group:g1"), 1);
        bus.leave_room(id_a, "group:g1");
        assert_eq!(bus.room_size("group:g1"), 0);
    }

    #[tokio::test]
    async fn queue_overflow_cancels_the_connection() {
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let id = bus.register("slow", tx, cancel.clone());
        bus.join_room(id, "group:g1");

        bus.publish(
            "group:g1",
            RealtimeEvent::new(EventKind::MessageNew, json!({"seq": 1})),
        );
        bus.publish(
            "group:g1",
            RealtimeEvent::new(EventKind::MessageNew, json!({"seq": 2})),
        );
        assert!(cancel.is_cancelled());
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn unregister_releases_room_memberships() {
        let bus = EventBus::new();
        let (id_a, _rx_a) = subscribe(&bus, "a");
        bus.join_room(id_a, "agent:a");
        bus.join_room(id_a, "group:g1");
        bus.unregister(id_a);
        assert_eq!(bus.room_size("agent:a"), 0);
        assert_eq!(bus.room_size("group:g1"), 0);
        assert_eq!(bus.connection_count(), 0);
    }
}

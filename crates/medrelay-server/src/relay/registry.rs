//! Connection and room registries.
//!
//! Both maps live in one [`Registries`] value so that every membership
//! change updates the connection record and the room's member set together.
//! Invariant: `connection.room_id == Some(r)` iff the connection is in
//! `rooms[r].members`, and no room is ever stored with zero members.

use chrono::{DateTime, Utc};
use medrelay_core::messages::ParticipantType;
use medrelay_core::{ConnectionId, ProtocolError, ServerMessage, ROOM_CAPACITY};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Instruction for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialize and send as a text frame.
    Message(ServerMessage),
    /// Send a WebSocket ping (liveness probe).
    Ping,
    /// Send a close frame and end the session.
    Close,
    /// Drop the socket without a close handshake.
    Terminate,
}

/// A live transport socket and its session metadata.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    /// Queue drained by the socket task; the only way to reach the transport.
    tx: mpsc::Sender<Outbound>,
    pub room_id: Option<String>,
    pub participant_id: Option<String>,
    pub participant_type: ParticipantType,
    /// Last pong or inbound frame.
    pub last_seen: Instant,
    pub connected_at: DateTime<Utc>,
}

/// A consultation room: at most [`ROOM_CAPACITY`] members, in join order.
#[derive(Debug, Default)]
pub struct Room {
    members: Vec<ConnectionId>,
}

impl Room {
    #[cfg(test)]
    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }
}

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    pub participant_count: usize,
    /// Room members other than the joiner.
    pub others: Vec<ConnectionId>,
    /// Set when the joiner had to leave a different room first.
    pub left: Option<LeaveOutcome>,
}

/// Result of removing a connection from its room.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOutcome {
    pub room_id: String,
    pub participant_id: String,
    pub remaining: Vec<ConnectionId>,
    pub room_closed: bool,
}

/// Aggregate counts for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub total_connections: usize,
    pub active_rooms: usize,
    pub rooms: Vec<RoomStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: String,
    pub participant_count: usize,
}

/// The connection registry and room registry, mutated as one unit.
#[derive(Debug, Default)]
pub struct Registries {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, Room>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection (not in any room).
    pub fn insert_connection(&mut self, id: ConnectionId, tx: mpsc::Sender<Outbound>, now: Instant) {
        let entry = ConnectionEntry {
            id: id.clone(),
            tx,
            room_id: None,
            participant_id: None,
            participant_type: ParticipantType::default(),
            last_seen: now,
            connected_at: Utc::now(),
        };
        self.connections.insert(id, entry);
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.values()
    }

    #[cfg(test)]
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    #[cfg(test)]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Refresh a connection's liveness timestamp.
    pub fn touch(&mut self, id: &ConnectionId, now: Instant) {
        if let Some(entry) = self.connections.get_mut(id) {
            entry.last_seen = now;
        }
    }

    /// Connections whose last activity is older than `timeout` at `now`.
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|e| e.id.clone())
            .collect()
    }

    /// `(room_id, participant_id)` of a joined connection.
    pub fn membership(&self, id: &ConnectionId) -> Result<(String, String), ProtocolError> {
        let entry = self
            .connections
            .get(id)
            .ok_or(ProtocolError::UnknownConnection)?;
        match (&entry.room_id, &entry.participant_id) {
            (Some(room), Some(participant)) => Ok((room.clone(), participant.clone())),
            _ => Err(ProtocolError::NotJoined),
        }
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Capacity and duplicate-participant checks run before any mutation, so
    /// a rejected join leaves every registry untouched. A connection joined
    /// to a different room leaves it first (with the usual `user-left`).
    pub fn join_room(
        &mut self,
        id: &ConnectionId,
        room_id: &str,
        participant_id: &str,
        participant_type: ParticipantType,
    ) -> Result<JoinOutcome, ProtocolError> {
        let current_room = self
            .connections
            .get(id)
            .ok_or(ProtocolError::UnknownConnection)?
            .room_id
            .clone();
        let rejoin = current_room.as_deref() == Some(room_id);

        if let Some(room) = self.rooms.get(room_id) {
            if !rejoin && room.members.len() >= ROOM_CAPACITY {
                return Err(ProtocolError::RoomFull);
            }
            let taken = room.members.iter().any(|member| {
                member != id
                    && self
                        .connections
                        .get(member)
                        .and_then(|e| e.participant_id.as_deref())
                        == Some(participant_id)
            });
            if taken {
                return Err(ProtocolError::DuplicateParticipant);
            }
        }

        let left = if current_room.is_some() && !rejoin {
            self.leave_room(id)
        } else {
            None
        };

        let room = self.rooms.entry(room_id.to_string()).or_default();
        if !room.members.contains(id) {
            room.members.push(id.clone());
        }
        let participant_count = room.members.len();
        let others = room.members.iter().filter(|m| *m != id).cloned().collect();

        if let Some(entry) = self.connections.get_mut(id) {
            entry.room_id = Some(room_id.to_string());
            entry.participant_id = Some(participant_id.to_string());
            entry.participant_type = participant_type;
        }

        info!(conn_id = %id, room_id, participant_id, participant_count, "joined room");

        Ok(JoinOutcome {
            participant_count,
            others,
            left,
        })
    }

    /// Remove a connection from its room and tell the remaining members.
    ///
    /// Deletes the room once it is empty. Returns `None` (and does nothing)
    /// when the connection is not in a room.
    pub fn leave_room(&mut self, id: &ConnectionId) -> Option<LeaveOutcome> {
        let entry = self.connections.get_mut(id)?;
        let room_id = entry.room_id.take()?;
        let participant_id = entry.participant_id.take().unwrap_or_default();
        entry.participant_type = ParticipantType::default();

        let remaining = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.members.retain(|m| m != id);
                room.members.clone()
            }
            None => Vec::new(),
        };
        let room_closed = remaining.is_empty();
        if room_closed {
            self.rooms.remove(&room_id);
            debug!(room_id = %room_id, "room closed");
        }

        let notice = ServerMessage::UserLeft {
            participant_id: participant_id.clone(),
            participant_count: remaining.len(),
        };
        for member in &remaining {
            self.send(member, notice.clone());
        }

        info!(conn_id = %id, room_id = %room_id, remaining = remaining.len(), "left room");

        Some(LeaveOutcome {
            room_id,
            participant_id,
            remaining,
            room_closed,
        })
    }

    /// Leave any room, then drop the connection record. Idempotent.
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.leave_room(id);
        self.connections.remove(id)
    }

    /// Resolve a participant id to its connection within one room.
    pub fn find_participant(&self, room_id: &str, participant_id: &str) -> Option<&ConnectionId> {
        self.rooms.get(room_id)?.members.iter().find(|member| {
            self.connections
                .get(*member)
                .and_then(|e| e.participant_id.as_deref())
                == Some(participant_id)
        })
    }

    /// Queue a message for one connection. Never blocks.
    pub fn send(&self, id: &ConnectionId, msg: ServerMessage) -> bool {
        match self.connections.get(id) {
            Some(entry) => entry.push(Outbound::Message(msg)),
            None => false,
        }
    }

    /// Queue a message for every member of a room except `exclude`.
    pub fn broadcast(&self, room_id: &str, msg: &ServerMessage, exclude: Option<&ConnectionId>) -> usize {
        let Some(room) = self.rooms.get(room_id) else {
            return 0;
        };
        room.members
            .iter()
            .filter(|m| Some(*m) != exclude)
            .filter(|m| self.send(m, msg.clone()))
            .count()
    }

    /// Queue a control instruction for one connection.
    pub fn push(&self, id: &ConnectionId, out: Outbound) -> bool {
        self.connections.get(id).is_some_and(|e| e.push(out))
    }

    pub fn stats(&self) -> RelayStats {
        let mut rooms: Vec<RoomStats> = self
            .rooms
            .iter()
            .map(|(room_id, room)| RoomStats {
                room_id: room_id.clone(),
                participant_count: room.members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        RelayStats {
            total_connections: self.connections.len(),
            active_rooms: self.rooms.len(),
            rooms,
        }
    }

    /// Check both registry invariants.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let forward = self.connections.values().all(|e| match &e.room_id {
            Some(r) => self.rooms.get(r).is_some_and(|room| room.members.contains(&e.id)),
            None => true,
        });
        let backward = self.rooms.iter().all(|(room_id, room)| {
            !room.members.is_empty()
                && room.members.len() <= ROOM_CAPACITY
                && room.members.iter().all(|m| {
                    self.connections
                        .get(m)
                        .is_some_and(|e| e.room_id.as_deref() == Some(room_id.as_str()))
                })
        });
        forward && backward
    }
}

impl ConnectionEntry {
    fn push(&self, out: Outbound) -> bool {
        match self.tx.try_send(out) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %self.id, "outbound queue closed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn connect(reg: &mut Registries, id: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(16);
        reg.insert_connection(ConnectionId::from(id), tx, Instant::now());
        rx
    }

    pub(crate) fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                out.push(msg);
            }
        }
        out
    }

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn first_join_creates_room() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let outcome = reg
            .join_room(&cid("a"), "room-1", "p1", ParticipantType::Doctor)
            .unwrap();
        assert_eq!(outcome.participant_count, 1);
        assert!(outcome.others.is_empty());
        assert_eq!(reg.room_count(), 1);
        assert!(reg.is_consistent());
    }

    #[test]
    fn third_join_is_rejected_without_change() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        let _c = connect(&mut reg, "c");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r", "p2", ParticipantType::Patient).unwrap();

        let err = reg
            .join_room(&cid("c"), "r", "p3", ParticipantType::Patient)
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoomFull);
        assert_eq!(reg.room("r").unwrap().members().len(), 2);
        assert!(reg.connection(&cid("c")).unwrap().room_id.is_none());
        assert!(reg.is_consistent());
    }

    #[test]
    fn member_can_rejoin_full_room() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r", "p2", ParticipantType::Patient).unwrap();

        let outcome = reg
            .join_room(&cid("b"), "r", "p2", ParticipantType::Patient)
            .unwrap();
        assert_eq!(outcome.participant_count, 2);
        assert!(outcome.left.is_none());
        assert!(reg.is_consistent());
    }

    #[test]
    fn duplicate_participant_id_is_rejected() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        let err = reg
            .join_room(&cid("b"), "r", "p1", ParticipantType::Patient)
            .unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateParticipant);
        assert_eq!(reg.room("r").unwrap().members().len(), 1);
    }

    #[test]
    fn switching_rooms_leaves_the_old_one() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r1", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r1", "p2", ParticipantType::Patient).unwrap();
        drain(&mut b);

        let outcome = reg
            .join_room(&cid("a"), "r2", "p1", ParticipantType::Doctor)
            .unwrap();
        let left = outcome.left.unwrap();
        assert_eq!(left.room_id, "r1");
        assert!(!left.room_closed);
        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::UserLeft {
                participant_id: "p1".into(),
                participant_count: 1,
            }]
        );
        assert_eq!(reg.room("r1").unwrap().members(), &[cid("b")]);
        assert_eq!(reg.room("r2").unwrap().members(), &[cid("a")]);
        assert!(reg.is_consistent());
    }

    #[test]
    fn rejected_switch_keeps_current_room() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        let _c = connect(&mut reg, "c");
        let _d = connect(&mut reg, "d");
        reg.join_room(&cid("a"), "r1", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r1", "p2", ParticipantType::Patient).unwrap();
        reg.join_room(&cid("c"), "r2", "p3", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("d"), "r2", "p4", ParticipantType::Patient).unwrap();
        drain(&mut b);

        let err = reg
            .join_room(&cid("a"), "r2", "p1", ParticipantType::Doctor)
            .unwrap_err();
        assert_eq!(err, ProtocolError::RoomFull);
        assert!(drain(&mut b).is_empty());
        assert_eq!(reg.room("r1").unwrap().members(), &[cid("a"), cid("b")]);
        assert_eq!(reg.room("r2").unwrap().members().len(), 2);
        let entry = reg.connection(&cid("a")).unwrap();
        assert_eq!(entry.room_id.as_deref(), Some("r1"));
        assert_eq!(entry.participant_id.as_deref(), Some("p1"));
        assert!(reg.is_consistent());
    }

    #[test]
    fn leave_outside_room_is_noop() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        assert!(reg.leave_room(&cid("a")).is_none());
        assert!(reg.leave_room(&cid("ghost")).is_none());
        assert!(drain(&mut a).is_empty());
        assert!(reg.is_consistent());
    }

    #[test]
    fn last_leave_deletes_room() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        let outcome = reg.leave_room(&cid("a")).unwrap();
        assert!(outcome.room_closed);
        assert!(reg.room("r").is_none());
        assert!(reg.connection(&cid("a")).unwrap().room_id.is_none());
        assert!(reg.is_consistent());
    }

    #[test]
    fn remove_connection_is_idempotent() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r", "p2", ParticipantType::Patient).unwrap();
        drain(&mut b);

        assert!(reg.remove_connection(&cid("a")).is_some());
        assert!(reg.remove_connection(&cid("a")).is_none());
        assert_eq!(drain(&mut b).len(), 1);
        assert_eq!(reg.connection_count(), 1);
        assert!(reg.is_consistent());
    }

    #[test]
    fn find_participant_is_scoped_to_room() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r1", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r2", "p2", ParticipantType::Patient).unwrap();
        assert_eq!(reg.find_participant("r1", "p1"), Some(&cid("a")));
        assert_eq!(reg.find_participant("r1", "p2"), None);
        assert_eq!(reg.find_participant("r3", "p1"), None);
    }

    #[test]
    fn broadcast_respects_exclusion() {
        let mut reg = Registries::new();
        let mut a = connect(&mut reg, "a");
        let mut b = connect(&mut reg, "b");
        reg.join_room(&cid("a"), "r", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r", "p2", ParticipantType::Patient).unwrap();
        let msg = ServerMessage::error("x");
        assert_eq!(reg.broadcast("r", &msg, Some(&cid("a"))), 1);
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![msg.clone()]);
        assert_eq!(reg.broadcast("r", &msg, None), 2);
        assert_eq!(reg.broadcast("nope", &msg, None), 0);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let mut reg = Registries::new();
        let (tx, _rx) = mpsc::channel(1);
        reg.insert_connection(cid("a"), tx, Instant::now());
        assert!(reg.send(&cid("a"), ServerMessage::error("1")));
        assert!(!reg.send(&cid("a"), ServerMessage::error("2")));
    }

    #[test]
    fn stale_connections_use_timeout() {
        let mut reg = Registries::new();
        let t0 = Instant::now();
        let (tx, _rx) = mpsc::channel(4);
        reg.insert_connection(cid("a"), tx, t0);
        let timeout = Duration::from_secs(30);
        assert!(reg.stale_connections(t0 + timeout, timeout).is_empty());
        assert_eq!(
            reg.stale_connections(t0 + timeout + Duration::from_secs(1), timeout),
            vec![cid("a")]
        );
        reg.touch(&cid("a"), t0 + timeout);
        assert!(reg
            .stale_connections(t0 + timeout + Duration::from_secs(1), timeout)
            .is_empty());
    }

    #[test]
    fn stats_report_rooms() {
        let mut reg = Registries::new();
        let _a = connect(&mut reg, "a");
        let _b = connect(&mut reg, "b");
        let _c = connect(&mut reg, "c");
        reg.join_room(&cid("a"), "r2", "p1", ParticipantType::Doctor).unwrap();
        reg.join_room(&cid("b"), "r2", "p2", ParticipantType::Patient).unwrap();
        reg.join_room(&cid("c"), "r1", "p3", ParticipantType::Patient).unwrap();
        let stats = reg.stats();
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.rooms[0].room_id, "r1");
        assert_eq!(stats.rooms[1].participant_count, 2);
    }
}

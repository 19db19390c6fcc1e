//! Room membership as a synchronous state machine.
//!
//! The registry owns no sockets. Every operation returns the [`Delivery`]
//! list the server must perform, in order.

use super::protocol::{PeerInfo, ServerMessage};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Server-assigned identifier of one client socket.
pub type ConnectionId = u64;

/// An action the server must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Send `message` on `connection`
    Send {
        /// Target socket
        connection: ConnectionId,
        /// Frame to send
        message: ServerMessage,
    },
    /// Close `connection` (superseded by a rejoin)
    Terminate {
        /// Socket to close
        connection: ConnectionId,
    },
}

#[derive(Debug, Clone)]
struct PeerRecord {
    display_name: String,
    last_seen: Instant,
    connection: ConnectionId,
}

/// Rooms keyed by code, each mapping peer ID to its record.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, BTreeMap<String, PeerRecord>>,
    memberships: HashMap<ConnectionId, Vec<(String, String)>>,
}

impl RoomRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id` in `room` on `connection`.
    ///
    /// A peer ID already present in the room on another connection is
    /// replaced and the old connection terminated.
    pub fn join(
        &mut self,
        connection: ConnectionId,
        room: &str,
        peer_id: &str,
        display_name: &str,
        now: Instant,
    ) -> Vec<Delivery> {
        let mut out = Vec::new();
        let members = self.rooms.entry(room.to_string()).or_default();

        if let Some(previous) = members.get(peer_id)
            && previous.connection != connection
        {
            info!(
                "Peer {} rejoined room {}; terminating connection {}",
                peer_id, room, previous.connection
            );
            let old = previous.connection;
            out.push(Delivery::Terminate { connection: old });
            forget_membership(&mut self.memberships, old, room, peer_id);
        }

        members.insert(
            peer_id.to_string(),
            PeerRecord {
                display_name: display_name.to_string(),
                last_seen: now,
                connection,
            },
        );
        let memberships = self.memberships.entry(connection).or_default();
        let key = (room.to_string(), peer_id.to_string());
        if !memberships.contains(&key) {
            memberships.push(key);
        }
        debug!(
            "Peer {} joined room {} ({} members)",
            peer_id,
            room,
            self.rooms.get(room).map_or(0, BTreeMap::len)
        );

        out.push(Delivery::Send {
            connection,
            message: ServerMessage::Peers {
                room: room.to_string(),
                peers: self.roster_excluding(room, peer_id),
            },
        });
        let joined = PeerInfo::new(peer_id, display_name);
        for (_, conn) in self.members_except(room, peer_id) {
            out.push(Delivery::Send {
                connection: conn,
                message: ServerMessage::PeerJoined {
                    peer: joined.clone(),
                },
            });
        }
        self.broadcast_roster(room, &mut out);
        out
    }

    /// Forward `data` from `from` to `to` within `room`.
    ///
    /// Signals addressed to a peer that is not in the room are dropped.
    pub fn signal(&self, room: &str, from: &str, to: &str, data: Value) -> Vec<Delivery> {
        match self.rooms.get(room).and_then(|members| members.get(to)) {
            Some(target) => vec![Delivery::Send {
                connection: target.connection,
                message: ServerMessage::Signal {
                    from: from.to_string(),
                    to: to.to_string(),
                    data,
                },
            }],
            None => {
                debug!("Dropping signal {} -> {}: not in room {}", from, to, room);
                Vec::new()
            }
        }
    }

    /// Remove `peer_id` from `room` if it is registered on `connection`.
    pub fn leave(&mut self, connection: ConnectionId, room: &str, peer_id: &str) -> Vec<Delivery> {
        let owned = self
            .rooms
            .get(room)
            .and_then(|members| members.get(peer_id))
            .is_some_and(|record| record.connection == connection);
        if !owned {
            debug!(
                "Ignoring leave of {} from room {} on connection {}",
                peer_id, room, connection
            );
            return Vec::new();
        }
        forget_membership(&mut self.memberships, connection, room, peer_id);
        self.remove_peer(room, peer_id)
    }

    /// Refresh the liveness of every registration of `peer_id` on
    /// `connection`.
    pub fn heartbeat(&mut self, connection: ConnectionId, peer_id: &str, now: Instant) {
        let Some(memberships) = self.memberships.get(&connection) else {
            return;
        };
        for (room, member) in memberships.iter().filter(|(_, p)| p.as_str() == peer_id) {
            if let Some(record) = self
                .rooms
                .get_mut(room)
                .and_then(|members| members.get_mut(member))
            {
                record.last_seen = now;
            }
        }
    }

    /// Drop every registration held by a closed connection.
    ///
    /// Registrations that were taken over by a newer connection are left
    /// untouched.
    pub fn connection_closed(&mut self, connection: ConnectionId) -> Vec<Delivery> {
        let mut out = Vec::new();
        for (room, peer_id) in self.memberships.remove(&connection).unwrap_or_default() {
            let owned = self
                .rooms
                .get(&room)
                .and_then(|members| members.get(&peer_id))
                .is_some_and(|record| record.connection == connection);
            if owned {
                out.extend(self.remove_peer(&room, &peer_id));
            }
        }
        out
    }

    /// Force-leave every peer whose last heartbeat is older than `timeout`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Delivery> {
        let expired: Vec<(String, String, ConnectionId)> = self
            .rooms
            .iter()
            .flat_map(|(room, members)| {
                members
                    .iter()
                    .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > timeout)
                    .map(|(peer_id, record)| (room.clone(), peer_id.clone(), record.connection))
            })
            .collect();

        let mut out = Vec::new();
        for (room, peer_id, connection) in expired {
            info!("Peer {} in room {} timed out", peer_id, room);
            forget_membership(&mut self.memberships, connection, &room, &peer_id);
            out.extend(self.remove_peer(&room, &peer_id));
        }
        out
    }

    /// Members of `room` (all of them), ordered by peer ID.
    pub fn roster(&self, room: &str) -> Vec<PeerInfo> {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, record)| PeerInfo::new(id, &record.display_name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Connection currently holding `peer_id` in `room`.
    pub fn connection_of(&self, room: &str, peer_id: &str) -> Option<ConnectionId> {
        self.rooms
            .get(room)
            .and_then(|members| members.get(peer_id))
            .map(|record| record.connection)
    }

    fn remove_peer(&mut self, room: &str, peer_id: &str) -> Vec<Delivery> {
        let mut out = Vec::new();
        let Some(members) = self.rooms.get_mut(room) else {
            return out;
        };
        if members.remove(peer_id).is_none() {
            return out;
        }
        if members.is_empty() {
            self.rooms.remove(room);
            debug!("Room {} is empty; removed", room);
            return out;
        }
        for (_, conn) in self.members_except(room, peer_id) {
            out.push(Delivery::Send {
                connection: conn,
                message: ServerMessage::PeerLeft {
                    peer_id: peer_id.to_string(),
                },
            });
        }
        self.broadcast_roster(room, &mut out);
        out
    }

    fn roster_excluding(&self, room: &str, peer_id: &str) -> Vec<PeerInfo> {
        self.roster(room)
            .into_iter()
            .filter(|peer| peer.peer_id != peer_id)
            .collect()
    }

    fn members_except(&self, room: &str, peer_id: &str) -> Vec<(String, ConnectionId)> {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|(id, _)| id.as_str() != peer_id)
                    .map(|(id, record)| (id.clone(), record.connection))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast_roster(&self, room: &str, out: &mut Vec<Delivery>) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for (id, record) in members {
            out.push(Delivery::Send {
                connection: record.connection,
                message: ServerMessage::Peers {
                    room: room.to_string(),
                    peers: self.roster_excluding(room, id),
                },
            });
        }
    }
}

fn forget_membership(
    memberships: &mut HashMap<ConnectionId, Vec<(String, String)>>,
    connection: ConnectionId,
    room: &str,
    peer_id: &str,
) {
    if let Some(list) = memberships.get_mut(&connection) {
        list.retain(|(r, p)| !(r == room && p == peer_id));
        if list.is_empty() {
            memberships.remove(&connection);
        }
    }
}

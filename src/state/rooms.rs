use std::{collections::HashMap, fmt};

use axum::extract::ws::Message;
use indexmap::IndexMap;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::state::session::{DeviceType, Session};

/// Identifier allocated for each accepted WebSocket connection.
pub type ConnectionId = Uuid;

#[derive(Clone, Debug)]
/// Handle used to push messages to an identified device connection.
pub struct DeviceConnection {
    pub id: ConnectionId,
    pub device_id: String,
    pub device_type: DeviceType,
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Named broadcast target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Targeted delivery to every connection of one device.
    Device(String),
    /// Every connection of one device type.
    DeviceType(DeviceType),
    /// Every connection joined while the session existed.
    Session(Uuid),
    /// Connections following one team.
    Team(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Device(id) => write!(f, "device:{id}"),
            Room::DeviceType(kind) => f.write_str(kind.as_str()),
            Room::Session(id) => write!(f, "session:{id}"),
            Room::Team(id) => write!(f, "team:{id}"),
        }
    }
}

/// Ordered set of rooms a connection belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSet(Vec<Room>);

impl RoomSet {
    /// Compute the rooms for a device: device, type, session (if any), then one per team.
    pub fn resolve(device_id: &str, device_type: DeviceType, session: Option<&Session>) -> Self {
        let mut rooms = vec![
            Room::Device(device_id.to_string()),
            Room::DeviceType(device_type),
        ];
        if let Some(session) = session {
            rooms.push(Room::Session(session.id));
            rooms.extend(session.team_ids().map(|team| Room::Team(team.to_string())));
        }
        Self(rooms)
    }

    /// Rooms in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Room> {
        self.0.iter()
    }

    /// Whether `room` is part of the set.
    pub fn contains(&self, room: &Room) -> bool {
        self.0.contains(room)
    }

    /// Room names in join order, as stored on the device record.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Number of rooms in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set has no rooms.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Default)]
struct RoomTable {
    members: HashMap<Room, IndexMap<ConnectionId, DeviceConnection>>,
    memberships: HashMap<ConnectionId, (DeviceConnection, RoomSet)>,
}

impl RoomTable {
    fn remove(&mut self, id: &ConnectionId) -> Option<(DeviceConnection, RoomSet)> {
        let (connection, rooms) = self.memberships.remove(id)?;
        for room in rooms.iter() {
            if let Some(members) = self.members.get_mut(room) {
                members.shift_remove(id);
                if members.is_empty() {
                    self.members.remove(room);
                }
            }
        }
        Some((connection, rooms))
    }
}

/// Room membership table shared by the room manager and the dispatcher.
#[derive(Default)]
pub struct RoomRegistry {
    table: RwLock<RoomTable>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the membership of `connection` with `rooms` in one step.
    ///
    /// The connection only becomes visible to broadcasts once every room is joined.
    pub async fn join(&self, connection: DeviceConnection, rooms: RoomSet) -> RoomSet {
        let mut table = self.table.write().await;
        table.remove(&connection.id);
        for room in rooms.iter() {
            table
                .members
                .entry(room.clone())
                .or_default()
                .insert(connection.id, connection.clone());
        }
        table
            .memberships
            .insert(connection.id, (connection, rooms.clone()));
        rooms
    }

    /// Drop a connection from every room it joined.
    pub async fn leave(&self, id: &ConnectionId) -> Option<RoomSet> {
        let mut table = self.table.write().await;
        table.remove(id).map(|(_, rooms)| rooms)
    }

    /// Rooms currently joined by a connection.
    pub async fn rooms_of(&self, id: &ConnectionId) -> Option<RoomSet> {
        let table = self.table.read().await;
        table.memberships.get(id).map(|(_, rooms)| rooms.clone())
    }

    /// Connections joined to `room`, in join order.
    pub async fn members(&self, room: &Room) -> Vec<DeviceConnection> {
        let table = self.table.read().await;
        table
            .members
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of the members of `rooms`, each connection listed once.
    pub async fn members_of_any(&self, rooms: &[Room]) -> Vec<DeviceConnection> {
        let table = self.table.read().await;
        let mut seen: IndexMap<ConnectionId, DeviceConnection> = IndexMap::new();
        for room in rooms {
            if let Some(members) = table.members.get(room) {
                for (id, connection) in members {
                    seen.entry(*id).or_insert_with(|| connection.clone());
                }
            }
        }
        seen.into_values().collect()
    }

    /// Every joined connection.
    pub async fn connections(&self) -> Vec<DeviceConnection> {
        let table = self.table.read().await;
        table
            .memberships
            .values()
            .map(|(connection, _)| connection.clone())
            .collect()
    }

    /// Whether any live connection belongs to `device_id`.
    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        let table = self.table.read().await;
        table
            .members
            .get(&Room::Device(device_id.to_string()))
            .is_some_and(|members| !members.is_empty())
    }
}

//! In-memory room registry for RustyArcade.
//!
//! Rooms are matchmaking slots for one game title: a host plus joiners up
//! to the game's player cap, with an idle/playing state machine. The
//! registry is serialized by one mutex and never talks to clients; the
//! session multiplexer turns its return values into broadcasts.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Idle,
    Playing,
}

#[derive(Debug, Clone)]
struct Room {
    id: u32,
    name: String,
    host: String,
    game: String,
    status: RoomStatus,
    game_port: u16,
    max_players: u32,
    players: Vec<String>,
}

/// Full view of one room. `players` is ordered with the host first.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub game: String,
    pub status: RoomStatus,
    pub players: Vec<String>,
    pub max_players: u32,
    pub game_port: u16,
}

/// Summary view used by room listings.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: u32,
    pub name: String,
    pub game: String,
    pub status: RoomStatus,
    pub players: usize,
    pub max_players: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The room was deleted: the host left, or the last member left.
    Dissolved,
    /// The user left and the room lives on.
    Left,
    /// No such room, or the user was not a member.
    NotFound,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<BTreeMap<u32, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        RoomRegistry::default()
    }

    /// Allocates the smallest positive id not currently in use; ids are
    /// reused after deletion. The host is always the first player.
    pub async fn create_room(
        &self,
        name: &str,
        host: &str,
        game: &str,
        max_players: u32,
    ) -> u32 {
        let mut rooms = self.rooms.lock().await;
        let mut id = 1u32;
        while rooms.contains_key(&id) {
            id += 1;
        }
        rooms.insert(
            id,
            Room {
                id,
                name: name.to_string(),
                host: host.to_string(),
                game: game.to_string(),
                status: RoomStatus::Idle,
                game_port: 0,
                max_players,
                players: vec![host.to_string()],
            },
        );
        id
    }

    /// Fails if the room is missing, not idle, full, or the user is
    /// already in it.
    pub async fn join_room(&self, room_id: u32, user: &str) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        if room.status != RoomStatus::Idle {
            return false;
        }
        if room.players.len() >= room.max_players as usize {
            return false;
        }
        if room.players.iter().any(|p| p == user) {
            return false;
        }
        room.players.push(user.to_string());
        true
    }

    pub async fn leave_room(&self, room_id: u32, user: &str) -> LeaveOutcome {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return LeaveOutcome::NotFound;
        };

        if room.host == user {
            rooms.remove(&room_id);
            return LeaveOutcome::Dissolved;
        }

        let Some(index) = room.players.iter().position(|p| p == user) else {
            return LeaveOutcome::NotFound;
        };
        room.players.remove(index);
        if room.players.is_empty() {
            rooms.remove(&room_id);
            return LeaveOutcome::Dissolved;
        }
        LeaveOutcome::Left
    }

    pub async fn is_room_full(&self, room_id: u32) -> bool {
        let rooms = self.rooms.lock().await;
        rooms
            .get(&room_id)
            .map(|r| r.players.len() == r.max_players as usize)
            .unwrap_or(false)
    }

    pub async fn get_room_info(&self, room_id: u32) -> Option<RoomInfo> {
        let rooms = self.rooms.lock().await;
        rooms.get(&room_id).map(|r| RoomInfo {
            id: r.id,
            name: r.name.clone(),
            host: r.host.clone(),
            game: r.game.clone(),
            status: r.status,
            players: r.players.clone(),
            max_players: r.max_players,
            game_port: r.game_port,
        })
    }

    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.lock().await;
        rooms
            .values()
            .map(|r| RoomSummary {
                id: r.id,
                name: r.name.clone(),
                game: r.game.clone(),
                status: r.status,
                players: r.players.len(),
                max_players: r.max_players,
            })
            .collect()
    }

    /// True if any room references the game, regardless of status. Guards
    /// game deletion.
    pub async fn is_game_active(&self, game: &str) -> bool {
        let rooms = self.rooms.lock().await;
        rooms.values().any(|r| r.game == game)
    }

    pub async fn start_game(&self, room_id: u32, port: u16) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        room.status = RoomStatus::Playing;
        room.game_port = port;
        true
    }

    pub async fn finish_game(&self, room_id: u32) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        room.status = RoomStatus::Idle;
        room.game_port = 0;
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Persistent catalog for RustyArcade.
//!
//! Stores user accounts, game records, comments, download sets and play
//! history in a single JSON document (`database.json`) that is rewritten
//! whole on every mutation. All operations are serialized by one mutex so
//! any task may call them; they are total and report outcomes through
//! return values, never errors. A failed disk write is logged and the
//! in-memory state stays authoritative for the rest of the process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::logging::{log, log_error, LogLevel};

// ============================================================================
// DOMAIN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Developer,
}

impl Default for Role {
    fn default() -> Self {
        Role::Player
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Developer => "developer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GameType {
    Cli,
    Gui,
}

impl Default for GameType {
    fn default() -> Self {
        GameType::Cli
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub user: String,
    pub score: u8,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub play_history: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub name: String,
    pub dev: String,
    pub description: String,
    pub filename: String,
    pub version: String,
    pub game_type: GameType,
    pub max_players: u32,
    #[serde(default)]
    pub downloaded_by: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Read-time view of a game: derived fields computed on the fly, the
/// `downloaded_by` set scrubbed.
#[derive(Debug, Clone, Serialize)]
pub struct GameListing {
    pub name: String,
    pub dev: String,
    pub description: String,
    pub filename: String,
    pub version: String,
    pub game_type: GameType,
    pub max_players: u32,
    pub avg_rating: f32,
    pub comment_count: usize,
    pub downloads: usize,
    pub comments: Vec<Comment>,
}

fn average_rating(comments: &[Comment]) -> f32 {
    if comments.is_empty() {
        return 0.0;
    }
    let sum: u32 = comments.iter().map(|c| c.score as u32).sum();
    sum as f32 / comments.len() as f32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    Added,
    Duplicate,
    Missing,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    games: Vec<GameRecord>,
}

// ============================================================================
// CATALOG
// ============================================================================

pub struct Catalog {
    path: PathBuf,
    data: Mutex<CatalogData>,
}

impl Catalog {
    /// Open the catalog at `path`. A missing file starts empty; a corrupt
    /// file is logged and replaced on the next save. Missing top-level
    /// collections load as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    log(
                        LogLevel::Warn,
                        &format!("Catalog file corrupted ({}), initializing new", e),
                    );
                    CatalogData::default()
                }
            },
            Err(_) => CatalogData::default(),
        };
        Catalog {
            path,
            data: Mutex::new(data),
        }
    }

    async fn save(&self, data: &CatalogData) {
        match serde_json::to_string_pretty(data) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.path, json).await {
                    log_error("Failed to write catalog file", &e);
                }
            }
            Err(e) => log_error("Failed to serialize catalog", &e),
        }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Returns false if the username is already taken.
    pub async fn register_user(&self, username: &str, password: &str, role: Role) -> bool {
        let mut data = self.data.lock().await;
        if data.users.iter().any(|u| u.username == username) {
            return false;
        }
        data.users.push(UserRecord {
            username: username.to_string(),
            password: password.to_string(),
            role,
            play_history: Vec::new(),
        });
        self.save(&data).await;
        true
    }

    /// Passwords are opaque strings compared verbatim.
    pub async fn login_user(&self, username: &str, password: &str) -> Option<Role> {
        let data = self.data.lock().await;
        data.users
            .iter()
            .find(|u| u.username == username && u.password == password)
            .map(|u| u.role)
    }

    pub async fn record_play_history(&self, username: &str, game_name: &str) {
        let mut data = self.data.lock().await;
        let Some(user) = data.users.iter_mut().find(|u| u.username == username) else {
            return;
        };
        if user.play_history.iter().any(|g| g == game_name) {
            return;
        }
        user.play_history.push(game_name.to_string());
        self.save(&data).await;
    }

    pub async fn has_played(&self, username: &str, game_name: &str) -> bool {
        let data = self.data.lock().await;
        data.users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.play_history.iter().any(|g| g == game_name))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Games
    // ------------------------------------------------------------------

    pub async fn get_games(&self) -> Vec<GameListing> {
        let data = self.data.lock().await;
        data.games
            .iter()
            .map(|g| GameListing {
                name: g.name.clone(),
                dev: g.dev.clone(),
                description: g.description.clone(),
                filename: g.filename.clone(),
                version: g.version.clone(),
                game_type: g.game_type,
                max_players: g.max_players,
                avg_rating: average_rating(&g.comments),
                comment_count: g.comments.len(),
                downloads: g.downloaded_by.len(),
                comments: g.comments.clone(),
            })
            .collect()
    }

    pub async fn get_game_filename(&self, game_name: &str) -> Option<String> {
        let data = self.data.lock().await;
        data.games
            .iter()
            .find(|g| g.name == game_name)
            .map(|g| g.filename.clone())
    }

    pub async fn get_game_owner(&self, game_name: &str) -> Option<String> {
        let data = self.data.lock().await;
        data.games
            .iter()
            .find(|g| g.name == game_name)
            .map(|g| g.dev.clone())
    }

    /// Falls back to 2 players when the game is unknown.
    pub async fn get_game_max_players(&self, game_name: &str) -> u32 {
        let data = self.data.lock().await;
        data.games
            .iter()
            .find(|g| g.name == game_name)
            .map(|g| g.max_players)
            .unwrap_or(2)
    }

    /// Insert-or-update keyed by (name, dev). Ownership must have been
    /// validated by the caller when updating; an update keeps the existing
    /// download set and comments.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_game(
        &self,
        dev: &str,
        name: &str,
        description: &str,
        filename: &str,
        version: &str,
        game_type: GameType,
        max_players: u32,
    ) {
        let mut data = self.data.lock().await;
        if let Some(game) = data
            .games
            .iter_mut()
            .find(|g| g.name == name && g.dev == dev)
        {
            game.description = description.to_string();
            game.filename = filename.to_string();
            game.version = version.to_string();
            game.game_type = game_type;
            game.max_players = max_players;
        } else {
            data.games.push(GameRecord {
                name: name.to_string(),
                dev: dev.to_string(),
                description: description.to_string(),
                filename: filename.to_string(),
                version: version.to_string(),
                game_type,
                max_players,
                downloaded_by: Vec::new(),
                comments: Vec::new(),
            });
        }
        self.save(&data).await;
    }

    /// Removes the game only if `dev` owns it; returns the stored filename
    /// so the caller can unlink the artifact.
    pub async fn delete_game(&self, dev: &str, game_name: &str) -> Option<String> {
        let mut data = self.data.lock().await;
        let index = data
            .games
            .iter()
            .position(|g| g.name == game_name && g.dev == dev)?;
        let filename = data.games.remove(index).filename;
        self.save(&data).await;
        Some(filename)
    }

    /// Idempotent: repeated downloads by the same user do not inflate the
    /// set.
    pub async fn record_download(&self, game_name: &str, username: &str) {
        let mut data = self.data.lock().await;
        let Some(game) = data.games.iter_mut().find(|g| g.name == game_name) else {
            return;
        };
        if game.downloaded_by.iter().any(|u| u == username) {
            return;
        }
        game.downloaded_by.push(username.to_string());
        self.save(&data).await;
    }

    pub async fn add_comment(
        &self,
        game_name: &str,
        username: &str,
        score: u8,
        content: &str,
    ) -> CommentOutcome {
        let mut data = self.data.lock().await;
        let Some(game) = data.games.iter_mut().find(|g| g.name == game_name) else {
            return CommentOutcome::Missing;
        };
        if game.comments.iter().any(|c| c.user == username) {
            return CommentOutcome::Duplicate;
        }
        game.comments.push(Comment {
            user: username.to_string(),
            score,
            content: content.to_string(),
        });
        self.save(&data).await;
        CommentOutcome::Added
    }
}

// ============================================================================
// TESTS
// ============================================================================

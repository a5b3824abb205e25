//! Lobby Server Module for RustyArcade
//!
//! TCP session multiplexer with support for:
//! - Player/developer authentication (register/login/logout)
//! - Game catalog browsing, rating, upload and download
//! - Room lifecycle with membership broadcasts to peers
//! - Ephemeral-port data channels handed to transfer workers
//! - Per-room game subprocess launch and reaping
//!
//! One task per connection: a reader that decodes framed requests and a
//! writer that drains the session's outbound mailbox. Room-mutating
//! handlers hold the session-map write guard across "registry mutation +
//! reply + peer notification" so every peer in a room observes membership
//! events in the order they were applied.

use crate::catalog::{Catalog, CommentOutcome, GameType, Role};
use crate::logging::{log, log_error, LogLevel};
use crate::protocol::{read_frame, write_frame, Event, Reply, Request};
use crate::rooms::{LeaveOutcome, RoomRegistry};
use crate::transfer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:10988";

/// Game processes listen on `GAME_PORT_BASE + room_id`.
const GAME_PORT_BASE: u16 = 14010;

/// Artifact directory under the server root.
pub const ARTIFACT_DIR: &str = "uploaded_games";

/// Catalog file under the server root.
pub const CATALOG_FILE: &str = "database.json";

type SessionId = u64;

// ============================================================================
// CLIENT SESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    LoggedIn,
    InRoom,
}

/// Per-connection state. Never persisted; destroyed on disconnect.
struct Session {
    state: SessionState,
    username: String,
    role: Option<Role>,
    room_id: Option<u32>,
    sender: mpsc::UnboundedSender<String>,
}

impl Session {
    fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Session {
            state: SessionState::Connected,
            username: String::new(),
            role: None,
            room_id: None,
            sender,
        }
    }
}

// ============================================================================
// LOBBY SERVER
// ============================================================================

pub struct LobbyServer {
    catalog: Catalog,
    rooms: RoomRegistry,
    /// Owned by the multiplexer; transfer workers and reapers never touch it.
    sessions: RwLock<HashMap<SessionId, Session>>,
    artifact_dir: PathBuf,
    next_session_id: AtomicU64,
}

impl LobbyServer {
    /// Bootstrap server state under `root`: create the artifact directory
    /// and open the catalog.
    pub async fn new(root: &Path) -> std::io::Result<Arc<Self>> {
        let artifact_dir = root.join(ARTIFACT_DIR);
        tokio::fs::create_dir_all(&artifact_dir).await?;
        let catalog = Catalog::open(root.join(CATALOG_FILE)).await;
        Ok(Arc::new(LobbyServer {
            catalog,
            rooms: RoomRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            artifact_dir,
            next_session_id: AtomicU64::new(1),
        }))
    }

    /// Main entry point: bind the control port and serve forever.
    pub async fn start(bind_address: &str, root: &Path) -> Result<(), Box<dyn std::error::Error>> {
        println!();
        println!("========================================");
        println!("     RustyArcade Hub Server Starting");
        println!("========================================");
        println!();

        let server = LobbyServer::new(root).await?;
        let listener = TcpListener::bind(bind_address).await?;

        log(
            LogLevel::Info,
            &format!("Catalog file: {}", root.join(CATALOG_FILE).display()),
        );
        log(
            LogLevel::Info,
            &format!("Artifact directory: {}", server.artifact_dir.display()),
        );
        log(
            LogLevel::Info,
            &format!("Lobby server listening on {}", bind_address),
        );
        println!();

        server.run(listener).await;
        Ok(())
    }

    /// Accept loop. Per-request errors never terminate it.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream).await {
                            log_error("Error handling client", &e);
                        }
                    });
                }
                Err(e) => log_error("Failed to accept connection", &e),
            }
        }
    }

    // ========================================================================
    // CONNECTION HANDLING
    // ========================================================================

    async fn handle_client(self: Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let peer = stream.peer_addr()?;
        log(LogLevel::Info, &format!("New connection from {}", peer));

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .write()
            .await
            .insert(session_id, Session::new(tx));

        let write_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if write_frame(&mut write_half, payload.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let payload = match read_frame(&mut read_half).await {
                Ok(payload) => payload,
                // framing violations and closed sockets both end the session
                Err(_) => break,
            };
            match serde_json::from_slice::<Request>(&payload) {
                Ok(request) => self.dispatch(session_id, request).await,
                // malformed bodies are dropped without a reply
                Err(_) => continue,
            }
        }

        self.disconnect(session_id).await;
        write_task.abort();
        log(LogLevel::Info, &format!("Connection closed: {}", peer));
        Ok(())
    }

    /// A failed read lands here: run the membership-change routine if the
    /// session was in a room, then destroy the session. No direct reply.
    async fn disconnect(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(room_id) = sessions.get(&session_id).and_then(|s| s.room_id) {
            self.broadcast_departure(&mut sessions, session_id, room_id)
                .await;
        }
        sessions.remove(&session_id);
    }

    // ========================================================================
    // REQUEST DISPATCH
    // ========================================================================

    async fn dispatch(&self, session_id: SessionId, request: Request) {
        {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };
            let who = if session.username.is_empty() {
                "Guest"
            } else {
                session.username.as_str()
            };
            log(
                LogLevel::Request,
                &format!("{}: {}", who, request.action_name()),
            );
        }

        match request {
            Request::Register {
                username,
                password,
                role,
            } => self.handle_register(session_id, username, password, role).await,
            Request::Login { username, password } => {
                self.handle_login(session_id, username, password).await
            }
            Request::Logout => self.handle_logout(session_id).await,
            Request::ListGames => self.handle_list_games(session_id).await,
            Request::ListRooms => self.handle_list_rooms(session_id).await,
            Request::ListPlayers => self.handle_list_players(session_id).await,
            Request::UploadRequest {
                gamename,
                is_new_game,
                filename,
                filesize,
                version,
                game_type,
                max_players,
                description,
            } => {
                self.handle_upload_request(
                    session_id,
                    gamename,
                    is_new_game,
                    filename,
                    filesize,
                    version,
                    game_type,
                    max_players,
                    description,
                )
                .await
            }
            Request::DownloadRequest { gamename } => {
                self.handle_download_request(session_id, gamename).await
            }
            Request::DeleteGame { gamename } => {
                self.handle_delete_game(session_id, gamename).await
            }
            Request::CreateRoom {
                room_name,
                game_name,
            } => self.handle_create_room(session_id, room_name, game_name).await,
            Request::JoinRoom { room_id } => self.handle_join_room(session_id, room_id).await,
            Request::LeaveRoom => self.handle_leave_room(session_id).await,
            Request::StartGame => self.handle_start_game(session_id).await,
            Request::FinishGame => self.handle_finish_game(session_id).await,
            Request::AddComment {
                game_name,
                score,
                content,
            } => {
                self.handle_add_comment(session_id, game_name, score, content)
                    .await
            }
        }
    }

    // ========================================================================
    // AUTH HANDLERS
    // ========================================================================

    async fn handle_register(
        &self,
        session_id: SessionId,
        username: String,
        password: String,
        role: Role,
    ) {
        let reply = if username.trim().is_empty() {
            Reply::error("Invalid username")
        } else if self.catalog.register_user(&username, &password, role).await {
            log(
                LogLevel::Auth,
                &format!("New {} registered: '{}'", role.as_str(), username),
            );
            Reply::ok().with_message("Registration successful")
        } else {
            log(
                LogLevel::Auth,
                &format!("Registration failed: username '{}' already exists", username),
            );
            Reply::error("Username already exists")
        };
        self.send_reply(session_id, reply).await;
    }

    async fn handle_login(&self, session_id: SessionId, username: String, password: String) {
        let mut sessions = self.sessions.write().await;
        let Some(state) = sessions.get(&session_id).map(|s| s.state) else {
            return;
        };

        let reply = if state != SessionState::Connected {
            Reply::error("Already logged in.")
        } else if sessions
            .values()
            .any(|s| s.username == username && s.state != SessionState::Connected)
        {
            Reply::error("User is already logged in.")
        } else {
            match self.catalog.login_user(&username, &password).await {
                Some(role) => {
                    log(
                        LogLevel::Auth,
                        &format!("User '{}' logged in as {}", username, role.as_str()),
                    );
                    if let Some(session) = sessions.get_mut(&session_id) {
                        session.state = SessionState::LoggedIn;
                        session.username = username;
                        session.role = Some(role);
                    }
                    Reply::ok().with_role(role)
                }
                None => Reply::error("Invalid username or password"),
            }
        };
        Self::send_to(&sessions, session_id, &reply);
    }

    async fn handle_logout(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some((state, room_id)) = sessions.get(&session_id).map(|s| (s.state, s.room_id))
        else {
            return;
        };
        if state == SessionState::Connected {
            Self::send_to(&sessions, session_id, &Reply::error("Not logged in."));
            return;
        }

        if let Some(room_id) = room_id {
            self.broadcast_departure(&mut sessions, session_id, room_id)
                .await;
        }
        if let Some(session) = sessions.get_mut(&session_id) {
            log(LogLevel::Auth, &format!("User '{}' logged out", session.username));
            session.state = SessionState::Connected;
            session.username.clear();
            session.role = None;
            session.room_id = None;
            Self::send(session, &Reply::ok());
        }
    }

    // ========================================================================
    // LISTING HANDLERS
    // ========================================================================

    async fn handle_list_games(&self, session_id: SessionId) {
        let games = self.catalog.get_games().await;
        self.send_reply(session_id, Reply::ok().with_data(&games)).await;
    }

    async fn handle_list_rooms(&self, session_id: SessionId) {
        let rooms = self.rooms.list_rooms().await;
        self.send_reply(session_id, Reply::ok().with_data(&rooms)).await;
    }

    async fn handle_list_players(&self, session_id: SessionId) {
        let sessions = self.sessions.read().await;
        let players: Vec<&str> = sessions
            .values()
            .filter(|s| s.role == Some(Role::Player) && !s.username.is_empty())
            .map(|s| s.username.as_str())
            .collect();
        Self::send_to(&sessions, session_id, &Reply::ok().with_data(&players));
    }

    // ========================================================================
    // GAME CATALOG HANDLERS
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn handle_upload_request(
        &self,
        session_id: SessionId,
        gamename: String,
        is_new_game: bool,
        filename: String,
        filesize: u64,
        version: String,
        game_type: GameType,
        max_players: u32,
        description: String,
    ) {
        let (state, role, username) = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };
            (session.state, session.role, session.username.clone())
        };
        if state == SessionState::Connected {
            self.send_reply(session_id, Reply::error("You must login first."))
                .await;
            return;
        }
        if role != Some(Role::Developer) {
            self.send_reply(
                session_id,
                Reply::error("Permission Denied: Only developers can upload games."),
            )
            .await;
            return;
        }

        let owner = self.catalog.get_game_owner(&gamename).await;
        if is_new_game {
            if let Some(owner) = owner {
                let message = if owner == username {
                    format!(
                        "Failed: You already have a game named '{}'. Please use 'Update Game'.",
                        gamename
                    )
                } else {
                    format!(
                        "Failed: Game name '{}' is already taken by another developer.",
                        gamename
                    )
                };
                self.send_reply(session_id, Reply::error(message)).await;
                return;
            }
        } else {
            match owner {
                None => {
                    self.send_reply(
                        session_id,
                        Reply::error(format!("Failed: Game '{}' does not exist.", gamename)),
                    )
                    .await;
                    return;
                }
                Some(owner) if owner != username => {
                    self.send_reply(
                        session_id,
                        Reply::error("Failed: Permission Denied. You do not own this game."),
                    )
                    .await;
                    return;
                }
                Some(_) => {}
            }
        }

        // artifacts are addressed by basename only
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            self.send_reply(session_id, Reply::error("Failed: Invalid filename."))
                .await;
            return;
        }

        let Some((listener, port)) = bind_transfer_port().await else {
            self.send_reply(
                session_id,
                Reply::error("Failed: Could not open a transfer port."),
            )
            .await;
            return;
        };

        let save_path = self.artifact_dir.join(&filename);
        log(
            LogLevel::Transfer,
            &format!("Receiving '{}' ({} bytes) on port {}", filename, filesize, port),
        );
        tokio::spawn(transfer::serve_upload(listener, save_path, filesize));

        // metadata is committed before the transfer completes; a failed
        // upload leaves the entry pointing at a missing or truncated file
        self.catalog
            .upsert_game(
                &username,
                &gamename,
                &description,
                &filename,
                &version,
                game_type,
                max_players,
            )
            .await;

        self.send_reply(session_id, Reply::ok().with_port(port)).await;
    }

    async fn handle_download_request(&self, session_id: SessionId, gamename: String) {
        let (state, username) = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };
            (session.state, session.username.clone())
        };
        if state == SessionState::Connected {
            self.send_reply(session_id, Reply::error("You must login first."))
                .await;
            return;
        }

        let Some(filename) = self.catalog.get_game_filename(&gamename).await else {
            self.send_reply(session_id, Reply::error("Game not found in DB"))
                .await;
            return;
        };
        let path = self.artifact_dir.join(&filename);
        let filesize = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                log(
                    LogLevel::Error,
                    &format!("File missing at: {}", path.display()),
                );
                self.send_reply(session_id, Reply::error("File missing on server"))
                    .await;
                return;
            }
        };

        self.catalog.record_download(&gamename, &username).await;

        let Some((listener, port)) = bind_transfer_port().await else {
            self.send_reply(
                session_id,
                Reply::error("Failed: Could not open a transfer port."),
            )
            .await;
            return;
        };
        log(
            LogLevel::Transfer,
            &format!("Ready to send {} ({} bytes) on port {}", filename, filesize, port),
        );
        tokio::spawn(transfer::serve_download(listener, path));

        self.send_reply(
            session_id,
            Reply::ok()
                .with_port(port)
                .with_filesize(filesize)
                .with_filename(filename),
        )
        .await;
    }

    async fn handle_delete_game(&self, session_id: SessionId, gamename: String) {
        let (state, role, username) = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };
            (session.state, session.role, session.username.clone())
        };
        if state == SessionState::Connected {
            self.send_reply(session_id, Reply::error("You must login first."))
                .await;
            return;
        }
        if role != Some(Role::Developer) {
            self.send_reply(
                session_id,
                Reply::error("Permission Denied: Only developers can delete games."),
            )
            .await;
            return;
        }

        if self.rooms.is_game_active(&gamename).await {
            self.send_reply(
                session_id,
                Reply::error(
                    "Failed: Game is currently active in a room. Please wait for matches to finish.",
                ),
            )
            .await;
            return;
        }

        let reply = match self.catalog.delete_game(&username, &gamename).await {
            Some(filename) => {
                let path = self.artifact_dir.join(&filename);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    log_error("Failed to remove artifact", &e);
                } else {
                    log(
                        LogLevel::Info,
                        &format!("Deleted game file: {}", path.display()),
                    );
                }
                Reply::ok().with_message("Game deleted successfully")
            }
            None => {
                Reply::error("Permission Denied: You do not own this game or it does not exist.")
            }
        };
        self.send_reply(session_id, reply).await;
    }

    async fn handle_add_comment(
        &self,
        session_id: SessionId,
        game_name: String,
        score: i64,
        content: String,
    ) {
        let (state, role, username) = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return;
            };
            (session.state, session.role, session.username.clone())
        };
        if state == SessionState::Connected {
            self.send_reply(session_id, Reply::error("You must login first."))
                .await;
            return;
        }
        if role != Some(Role::Player) {
            self.send_reply(
                session_id,
                Reply::error("Permission Denied: Only players can rate games."),
            )
            .await;
            return;
        }
        if !(1..=5).contains(&score) {
            self.send_reply(session_id, Reply::error("Score must be between 1 and 5."))
                .await;
            return;
        }

        let reply = if !self.catalog.has_played(&username, &game_name).await {
            Reply::error("You must play this game before rating it!")
        } else {
            match self
                .catalog
                .add_comment(&game_name, &username, score as u8, &content)
                .await
            {
                CommentOutcome::Added => Reply::ok().with_message("Comment added successfully"),
                CommentOutcome::Duplicate | CommentOutcome::Missing => {
                    Reply::error("You have already rated this game or game not found.")
                }
            }
        };
        self.send_reply(session_id, reply).await;
    }

    // ========================================================================
    // ROOM HANDLERS
    // ========================================================================

    async fn handle_create_room(
        &self,
        session_id: SessionId,
        room_name: String,
        game_name: String,
    ) {
        let mut sessions = self.sessions.write().await;
        let Some((state, role, username)) = sessions
            .get(&session_id)
            .map(|s| (s.state, s.role, s.username.clone()))
        else {
            return;
        };

        let reply = if state == SessionState::Connected {
            Reply::error("You must login first.")
        } else if state == SessionState::InRoom {
            Reply::error("Already in a room.")
        } else if role != Some(Role::Player) {
            Reply::error("Permission Denied: Only players can create rooms.")
        } else if self.catalog.get_game_filename(&game_name).await.is_none() {
            Reply::error("Game not found")
        } else {
            let max_players = self.catalog.get_game_max_players(&game_name).await;
            let room_id = self
                .rooms
                .create_room(&room_name, &username, &game_name, max_players)
                .await;
            if let Some(session) = sessions.get_mut(&session_id) {
                session.state = SessionState::InRoom;
                session.room_id = Some(room_id);
            }
            log(
                LogLevel::Room,
                &format!(
                    "Room '{}' (ID: {}) created by '{}' for game '{}'",
                    room_name, room_id, username, game_name
                ),
            );
            // the creator is the sole member, so nobody to notify
            match self.rooms.get_room_info(room_id).await {
                Some(info) => Reply::ok().with_room_id(room_id).with_data(&info),
                None => Reply::ok().with_room_id(room_id),
            }
        };
        Self::send_to(&sessions, session_id, &reply);
    }

    async fn handle_join_room(&self, session_id: SessionId, room_id: u32) {
        let mut sessions = self.sessions.write().await;
        let Some((state, role, username)) = sessions
            .get(&session_id)
            .map(|s| (s.state, s.role, s.username.clone()))
        else {
            return;
        };

        if state == SessionState::Connected {
            Self::send_to(&sessions, session_id, &Reply::error("You must login first."));
            return;
        }
        if state == SessionState::InRoom {
            Self::send_to(&sessions, session_id, &Reply::error("Already in a room."));
            return;
        }
        if role != Some(Role::Player) {
            Self::send_to(
                &sessions,
                session_id,
                &Reply::error("Permission Denied: Only players can join rooms."),
            );
            return;
        }

        if !self.rooms.join_room(room_id, &username).await {
            Self::send_to(
                &sessions,
                session_id,
                &Reply::error("Cannot join (Room full or playing)"),
            );
            return;
        }

        if let Some(session) = sessions.get_mut(&session_id) {
            session.state = SessionState::InRoom;
            session.room_id = Some(room_id);
        }
        let Some(info) = self.rooms.get_room_info(room_id).await else {
            return;
        };
        Self::send_to(
            &sessions,
            session_id,
            &Reply::ok().with_message("Joined").with_data(&info),
        );

        let event = Event::PlayerJoined {
            username: username.clone(),
            data: info,
        };
        for (id, session) in sessions.iter() {
            if *id != session_id && session.room_id == Some(room_id) {
                Self::notify(session, &event);
            }
        }
        log(LogLevel::Room, &format!("'{}' joined room {}", username, room_id));
    }

    async fn handle_leave_room(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some(room_id) = sessions.get(&session_id).and_then(|s| s.room_id) else {
            Self::send_to(&sessions, session_id, &Reply::error("You are not in a room."));
            return;
        };

        // the leaver hears its ok before peers hear the membership change
        Self::send_to(&sessions, session_id, &Reply::ok());
        self.broadcast_departure(&mut sessions, session_id, room_id)
            .await;

        if let Some(session) = sessions.get_mut(&session_id) {
            session.state = SessionState::LoggedIn;
            session.room_id = None;
        }
    }

    /// Common membership-change routine for explicit leave, logout and
    /// disconnect: apply the removal to the registry, then notify every
    /// remaining peer of the old room exactly once.
    async fn broadcast_departure(
        &self,
        sessions: &mut HashMap<SessionId, Session>,
        leaver_id: SessionId,
        room_id: u32,
    ) {
        let Some(username) = sessions.get(&leaver_id).map(|s| s.username.clone()) else {
            return;
        };

        match self.rooms.leave_room(room_id, &username).await {
            LeaveOutcome::Dissolved => {
                let event = Event::RoomDisbanded;
                for (id, session) in sessions.iter_mut() {
                    if *id != leaver_id && session.room_id == Some(room_id) {
                        Self::notify(session, &event);
                        session.state = SessionState::LoggedIn;
                        session.room_id = None;
                    }
                }
                log(
                    LogLevel::Room,
                    &format!("Room {} disbanded ('{}' left)", room_id, username),
                );
            }
            LeaveOutcome::Left => {
                if let Some(info) = self.rooms.get_room_info(room_id).await {
                    let event = Event::PlayerLeft {
                        username: username.clone(),
                        data: info,
                    };
                    for (id, session) in sessions.iter() {
                        if *id != leaver_id && session.room_id == Some(room_id) {
                            Self::notify(session, &event);
                        }
                    }
                }
                log(LogLevel::Room, &format!("'{}' left room {}", username, room_id));
            }
            LeaveOutcome::NotFound => {}
        }
    }

    // ========================================================================
    // GAME SESSION HANDLERS
    // ========================================================================

    async fn handle_start_game(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some((state, username, room_id)) = sessions
            .get(&session_id)
            .map(|s| (s.state, s.username.clone(), s.room_id))
        else {
            return;
        };
        if state != SessionState::InRoom {
            Self::send_to(&sessions, session_id, &Reply::error("You are not in a room."));
            return;
        }
        let Some(room_id) = room_id else {
            return;
        };
        let Some(info) = self.rooms.get_room_info(room_id).await else {
            return;
        };
        if info.host != username {
            Self::send_to(
                &sessions,
                session_id,
                &Reply::error("Only the host can start the game."),
            );
            return;
        }
        if !self.rooms.is_room_full(room_id).await {
            Self::send_to(
                &sessions,
                session_id,
                &Reply::error("Cannot start: Room is not full yet."),
            );
            return;
        }

        let filename = self
            .catalog
            .get_game_filename(&info.game)
            .await
            .unwrap_or_default();
        let game_port = GAME_PORT_BASE + room_id as u16;

        self.launch_game_process(&filename, game_port);
        self.rooms.start_game(room_id, game_port).await;
        log(
            LogLevel::Game,
            &format!("Room {} started '{}' on port {}", room_id, info.game, game_port),
        );

        // every member, host included, learns where to connect
        let event = Event::GameStart {
            game_port,
            filename,
        };
        for session in sessions.values() {
            if session.room_id == Some(room_id) {
                Self::notify(session, &event);
            }
        }
    }

    async fn handle_finish_game(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        let Some((state, username, room_id)) = sessions
            .get(&session_id)
            .map(|s| (s.state, s.username.clone(), s.room_id))
        else {
            return;
        };
        if state != SessionState::InRoom {
            Self::send_to(&sessions, session_id, &Reply::error("You are not in a room."));
            return;
        }
        let Some(room_id) = room_id else {
            return;
        };
        let Some(info) = self.rooms.get_room_info(room_id).await else {
            return;
        };
        if info.host != username {
            Self::send_to(
                &sessions,
                session_id,
                &Reply::error("Only the host can finish the game."),
            );
            return;
        }

        self.rooms.finish_game(room_id).await;
        for player in &info.players {
            self.catalog.record_play_history(player, &info.game).await;
        }
        log(
            LogLevel::Game,
            &format!("Room {} finished '{}'", room_id, info.game),
        );

        if let Some(updated) = self.rooms.get_room_info(room_id).await {
            let event = Event::RoomReset { data: updated };
            for session in sessions.values() {
                if session.room_id == Some(room_id) {
                    Self::notify(session, &event);
                }
            }
        }
    }

    /// Fork-exec the game binary. The detached wait() task reaps the child
    /// whenever it exits; its status is ignored.
    fn launch_game_process(&self, filename: &str, game_port: u16) {
        let path = self.artifact_dir.join(filename);
        let mut command = Command::new("python3");
        command
            .arg(&path)
            .arg("--server")
            .arg(game_port.to_string());
        match command.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => log_error("Failed to launch game process", &e),
        }
    }

    // ========================================================================
    // OUTBOUND MAILBOXES
    // ========================================================================

    fn send(session: &Session, reply: &Reply) {
        if let Ok(json) = serde_json::to_string(reply) {
            let _ = session.sender.send(json);
        }
    }

    fn notify(session: &Session, event: &Event) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = session.sender.send(json);
        }
    }

    fn send_to(sessions: &HashMap<SessionId, Session>, session_id: SessionId, reply: &Reply) {
        if let Some(session) = sessions.get(&session_id) {
            Self::send(session, reply);
        }
    }

    async fn send_reply(&self, session_id: SessionId, reply: Reply) {
        let sessions = self.sessions.read().await;
        Self::send_to(&sessions, session_id, &reply);
    }
}

async fn bind_transfer_port() -> Option<(TcpListener, u16)> {
    let listener = match TcpListener::bind(("0.0.0.0", 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            log_error("Cannot bind transfer socket", &e);
            return None;
        }
    };
    match listener.local_addr() {
        Ok(addr) => Some((listener, addr.port())),
        Err(e) => {
            log_error("Cannot resolve transfer socket address", &e);
            None
        }
    }
}

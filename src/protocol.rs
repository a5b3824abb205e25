//! Control-channel protocol for RustyArcade.
//!
//! Every message on the control connection is a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON. Requests carry an `action`
//! tag and deserialize into [`Request`]; the server answers with a
//! [`Reply`] envelope and pushes [`Event`] notifications to room peers.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::catalog::{GameType, Role};
use crate::rooms::RoomInfo;

/// Maximum frame payload in bytes. Zero-length and oversized frames are
/// protocol errors that close the connection.
pub const MAX_FRAME_SIZE: usize = 65536;

// ============================================================================
// FRAMED CODEC
// ============================================================================

/// Read one whole frame from the stream. `read_exact` loops internally, so
/// partial socket reads never surface a short payload.
pub async fn read_frame<R>(stream: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} out of range", len),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one whole frame: header and payload in a single buffer so the
/// frame goes out in one `write_all`.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() || payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} out of range", payload.len()),
        ));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

// ============================================================================
// REQUESTS
// ============================================================================

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_players() -> u32 {
    2
}

/// One variant per client action. Unknown actions and missing required
/// fields fail deserialization and the request is dropped.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Register {
        username: String,
        password: String,
        #[serde(default)]
        role: Role,
    },
    Login {
        username: String,
        password: String,
    },
    Logout,
    ListGames,
    ListRooms,
    ListPlayers,
    UploadRequest {
        gamename: String,
        #[serde(default)]
        is_new_game: bool,
        filename: String,
        filesize: u64,
        #[serde(default = "default_version")]
        version: String,
        #[serde(default)]
        game_type: GameType,
        #[serde(default = "default_max_players")]
        max_players: u32,
        #[serde(default)]
        description: String,
    },
    DownloadRequest {
        gamename: String,
    },
    DeleteGame {
        gamename: String,
    },
    CreateRoom {
        room_name: String,
        game_name: String,
    },
    JoinRoom {
        room_id: u32,
    },
    LeaveRoom,
    StartGame,
    FinishGame,
    AddComment {
        game_name: String,
        score: i64,
        content: String,
    },
}

impl Request {
    /// Wire name of the action, for request logging.
    pub fn action_name(&self) -> &'static str {
        match self {
            Request::Register { .. } => "register",
            Request::Login { .. } => "login",
            Request::Logout => "logout",
            Request::ListGames => "list_games",
            Request::ListRooms => "list_rooms",
            Request::ListPlayers => "list_players",
            Request::UploadRequest { .. } => "upload_request",
            Request::DownloadRequest { .. } => "download_request",
            Request::DeleteGame { .. } => "delete_game",
            Request::CreateRoom { .. } => "create_room",
            Request::JoinRoom { .. } => "join_room",
            Request::LeaveRoom => "leave_room",
            Request::StartGame => "start_game",
            Request::FinishGame => "finish_game",
            Request::AddComment { .. } => "add_comment",
        }
    }
}

// ============================================================================
// REPLIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Direct reply envelope. Absent fields stay off the wire.
#[derive(Debug, Serialize)]
pub struct Reply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Reply {
            status: Status::Ok,
            message: None,
            role: None,
            room_id: None,
            data: None,
            port: None,
            filesize: None,
            filename: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut reply = Reply::ok();
        reply.status = Status::Error;
        reply.message = Some(message.into());
        reply
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_room_id(mut self, room_id: u32) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_filesize(mut self, filesize: u64) -> Self {
        self.filesize = Some(filesize);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

// ============================================================================
// PEER NOTIFICATIONS
// ============================================================================

/// Server-pushed notifications fanned out to room peers.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Event {
    PlayerJoined { username: String, data: RoomInfo },
    PlayerLeft { username: String, data: RoomInfo },
    RoomDisbanded,
    RoomReset { data: RoomInfo },
    GameStart { game_port: u16, filename: String },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, br#"{"action":"list_games"}"#)
            .await
            .unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, br#"{"action":"list_games"}"#);
    }

    #[tokio::test]
    async fn zero_length_frame_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut b).await.is_err());

        let mut sink = tokio::io::sink();
        let oversized = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(write_frame(&mut sink, &oversized).await.is_err());
        assert!(write_frame(&mut sink, &[]).await.is_err());
    }

    #[test]
    fn request_dispatches_on_action_tag() {
        let req: Request =
            serde_json::from_str(r#"{"action":"login","username":"alice","password":"pw"}"#)
                .unwrap();
        assert!(matches!(req, Request::Login { .. }));
        assert_eq!(req.action_name(), "login");

        assert!(serde_json::from_str::<Request>(r#"{"action":"warp_ten"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"action":"login"}"#).is_err());
    }

    #[test]
    fn upload_request_fills_defaults() {
        let req: Request = serde_json::from_str(
            r#"{"action":"upload_request","gamename":"tic","filename":"t.py","filesize":120}"#,
        )
        .unwrap();
        match req {
            Request::UploadRequest {
                is_new_game,
                version,
                game_type,
                max_players,
                description,
                ..
            } => {
                assert!(!is_new_game);
                assert_eq!(version, "1.0");
                assert_eq!(game_type, GameType::Cli);
                assert_eq!(max_players, 2);
                assert!(description.is_empty());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn reply_skips_absent_fields() {
        let value = serde_json::to_value(Reply::ok()).unwrap();
        assert_eq!(value, serde_json::json!({"status": "ok"}));

        let value = serde_json::to_value(Reply::error("nope")).unwrap();
        assert_eq!(value, serde_json::json!({"status": "error", "message": "nope"}));

        let value = serde_json::to_value(Reply::ok().with_role(Role::Developer)).unwrap();
        assert_eq!(value["role"], "developer");
    }

    #[test]
    fn event_wire_tags() {
        let value = serde_json::to_value(Event::RoomDisbanded).unwrap();
        assert_eq!(value, serde_json::json!({"action": "room_disbanded"}));

        let value = serde_json::to_value(Event::GameStart {
            game_port: 14011,
            filename: "t.py".to_string(),
        })
        .unwrap();
        assert_eq!(value["action"], "game_start");
        assert_eq!(value["game_port"], 14011);
        assert_eq!(value["filename"], "t.py");
    }
}

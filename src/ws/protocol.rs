//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::bracket::TournamentBracket;
use crate::game::competitor::CompetitorView;
use crate::game::session::{SessionConfig, SessionStatus};

/// Which of the connection's competitors a move targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveTarget {
    /// The connection owner's own paddle
    #[default]
    User,
    /// The local competitor sharing this connection
    Local,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Movement intent, overwrites the stored direction
    Move {
        /// -1, 0 or 1; anything else is normalized
        dir: f64,
        #[serde(default)]
        user: MoveTarget,
    },

    /// Admin: add an AI competitor
    AddAi {
        #[serde(default = "default_ai_skill")]
        skill: u8,
    },

    /// Add a local competitor sharing this connection
    AddLocal {
        #[serde(default)]
        name: Option<String>,
    },

    /// Admin: remove a competitor by player id
    Remove { player_id: u32 },

    /// Leave the session
    Leave,

    /// Admin: request the match start
    Start,

    /// Admin: change session settings while waiting
    Settings {
        #[serde(flatten)]
        update: SettingsUpdate,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

fn default_ai_skill() -> u8 {
    5
}

/// Partial settings change, absent fields stay as they are
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub map: Option<String>,
    pub max_players: Option<usize>,
    pub lives: Option<u32>,
    pub ball_speed: Option<f64>,
    pub paddle_speed: Option<f64>,
    pub powerups: Option<bool>,
    pub wonky: Option<bool>,
    pub difficulty: Option<u8>,
    pub tournament: Option<bool>,
}

/// Messages sent from server to client.
///
/// The per-tick `state` frame is serialized straight from the world by
/// [`crate::game::snapshot::SnapshotBuilder`] and has no variant here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        user_id: Uuid,
        session_id: Uuid,
        player_id: u32,
        server_time: u64,
    },

    /// Match is running; carries the session id
    GameStarted { message: String },

    /// Match is over; carries the reason
    GameClosed { message: String },

    /// Lobby view after any roster or settings change
    Lobby { view: LobbyView },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(code: &str, message: impl ToString) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Lobby action a client may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyControl {
    AddAi,
    AddLocal,
    Remove,
    Settings,
    Start,
    Leave,
}

impl LobbyControl {
    pub const ADMIN: &'static [LobbyControl] = &[
        LobbyControl::AddAi,
        LobbyControl::AddLocal,
        LobbyControl::Remove,
        LobbyControl::Settings,
        LobbyControl::Start,
        LobbyControl::Leave,
    ];
    pub const MEMBER: &'static [LobbyControl] = &[LobbyControl::AddLocal, LobbyControl::Leave];
}

/// Rendered lobby; the admin variant carries the full control set
#[derive(Debug, Clone, Serialize)]
pub struct LobbyView {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub admin: bool,
    pub settings: SessionConfig,
    pub competitors: Vec<CompetitorView>,
    pub controls: Vec<LobbyControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bracket: Option<TournamentBracket>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_defaults_to_user() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"move","dir":-1}"#).unwrap();
        match msg {
            ClientMsg::Move { dir, user } => {
                assert_eq!(dir, -1.0);
                assert_eq!(user, MoveTarget::User);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"move","dir":1,"user":"local"}"#).unwrap();
        assert!(matches!(msg, ClientMsg::Move { user: MoveTarget::Local, .. }));
    }

    #[test]
    fn test_settings_are_flattened() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"settings","lives":5,"wonky":true}"#).unwrap();
        let ClientMsg::Settings { update } = msg else {
            panic!("expected settings");
        };
        assert_eq!(update.lives, Some(5));
        assert_eq!(update.wonky, Some(true));
        assert!(update.map.is_none());
    }

    #[test]
    fn test_lifecycle_messages_shape() {
        let json = serde_json::to_value(ServerMsg::GameClosed {
            message: "alice won".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "game_closed");
        assert_eq!(json["message"], "alice won");

        let json = serde_json::to_value(ServerMsg::error("full", "Session is full")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "full");
    }
}

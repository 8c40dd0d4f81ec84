use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// Network-path candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    pub game_id: String,
    pub server_name: String,
    #[serde(default)]
    pub player_amount: u32,
    pub max_players: u32,
    #[serde(default)]
    pub requires_password: bool,
}

impl GameInfo {
    /// `id;name;amount;max;requiresPassword`
    pub fn encode(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.game_id,
            self.server_name,
            self.player_amount,
            self.max_players,
            self.requires_password
        )
    }
}

/// Joins encoded entries with `|`, the listing format polling clients parse.
pub fn encode_game_list(games: &[GameInfo]) -> String {
    games
        .iter()
        .map(GameInfo::encode)
        .collect::<Vec<_>>()
        .join("|")
}

/// Everything exchanged with the lobby, plus the two local-only notices
/// (`lobbyConnectionLost`, `connected`) fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    CreateGame {
        server_name: String,
        max_players: u32,
        requires_password: bool,
    },
    GameCreated {
        game_id: String,
    },
    NewClient {
        client_id: String,
        #[serde(default)]
        password: Option<String>,
    },
    AcceptJoin {
        #[serde(default)]
        game_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    RejectJoin {
        #[serde(default)]
        game_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    JoinGame {
        game_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    ListGames,
    GameList {
        #[serde(default)]
        games: Vec<GameInfo>,
    },
    UpdateGameInfo {
        server_name: String,
        player_amount: u32,
        max_players: u32,
        requires_password: bool,
    },
    WebrtcSignaling {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },
    ClientVanished {
        client_id: String,
    },
    LobbyConnectionLost,
    Connected,
    Error {
        #[serde(default)]
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CreateGame,
    GameCreated,
    NewClient,
    AcceptJoin,
    RejectJoin,
    JoinGame,
    ListGames,
    GameList,
    UpdateGameInfo,
    WebrtcSignaling,
    ClientVanished,
    LobbyConnectionLost,
    Connected,
    Error,
    Unknown,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::CreateGame { .. } => SignalKind::CreateGame,
            SignalMessage::GameCreated { .. } => SignalKind::GameCreated,
            SignalMessage::NewClient { .. } => SignalKind::NewClient,
            SignalMessage::AcceptJoin { .. } => SignalKind::AcceptJoin,
            SignalMessage::RejectJoin { .. } => SignalKind::RejectJoin,
            SignalMessage::JoinGame { .. } => SignalKind::JoinGame,
            SignalMessage::ListGames => SignalKind::ListGames,
            SignalMessage::GameList { .. } => SignalKind::GameList,
            SignalMessage::UpdateGameInfo { .. } => SignalKind::UpdateGameInfo,
            SignalMessage::WebrtcSignaling { .. } => SignalKind::WebrtcSignaling,
            SignalMessage::ClientVanished { .. } => SignalKind::ClientVanished,
            SignalMessage::LobbyConnectionLost => SignalKind::LobbyConnectionLost,
            SignalMessage::Connected => SignalKind::Connected,
            SignalMessage::Error { .. } => SignalKind::Error,
            SignalMessage::Unknown => SignalKind::Unknown,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn create_game_uses_lobby_field_names() {
        let message = SignalMessage::CreateGame {
            server_name: "dunes".into(),
            max_players: 3,
            requires_password: true,
        };
        let value: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "createGame",
                "serverName": "dunes",
                "maxPlayers": 3,
                "requiresPassword": true,
            })
        );
    }

    #[test]
    fn signaling_payload_accepts_browser_shapes() {
        let text = r#"{
            "type": "webrtcSignaling",
            "clientId": "c-1",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            }
        }"#;
        let message = SignalMessage::decode(text).unwrap();
        let SignalMessage::WebrtcSignaling {
            client_id,
            description,
            candidate,
        } = message
        else {
            panic!("expected webrtcSignaling");
        };
        assert_eq!(client_id.as_deref(), Some("c-1"));
        assert!(description.is_none());
        let candidate = candidate.expect("candidate");
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn end_of_candidates_decodes_as_empty_signal() {
        let message =
            SignalMessage::decode(r#"{"type":"webrtcSignaling","candidate":null}"#).unwrap();
        assert_eq!(
            message,
            SignalMessage::WebrtcSignaling {
                client_id: None,
                description: None,
                candidate: None,
            }
        );
    }

    #[test]
    fn unknown_tags_are_tolerated() {
        let message = SignalMessage::decode(r#"{"type":"serverStats","load":3}"#).unwrap();
        assert_eq!(message.kind(), SignalKind::Unknown);
    }

    #[test]
    fn client_side_join_omits_missing_password() {
        let message = SignalMessage::JoinGame {
            game_id: "g1".into(),
            password: None,
        };
        assert_eq!(message.encode().unwrap(), r#"{"type":"joinGame","gameId":"g1"}"#);
    }

    #[test]
    fn game_list_encoding_matches_polling_format() {
        let games = vec![
            GameInfo {
                game_id: "a1".into(),
                server_name: "North".into(),
                player_amount: 1,
                max_players: 4,
                requires_password: false,
            },
            GameInfo {
                game_id: "b2".into(),
                server_name: "South".into(),
                player_amount: 2,
                max_players: 2,
                requires_password: true,
            },
        ];
        assert_eq!(
            encode_game_list(&games),
            "a1;North;1;4;false|b2;South;2;2;true"
        );
        assert_eq!(encode_game_list(&[]), "");
    }
}

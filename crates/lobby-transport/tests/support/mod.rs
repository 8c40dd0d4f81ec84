//! Minimal websocket lobby speaking the rendezvous protocol, plus helpers
//! shared by the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use lobby_transport::{Lobby, LobbyConfig, LoopbackBackend};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A lobby client on the shared loopback network.
pub fn lobby(stub: &StubLobby, max_peers: usize, backend: &LoopbackBackend) -> Lobby {
    let config = LobbyConfig::new(&stub.url, max_peers)
        .expect("lobby config")
        .with_timeouts(Duration::from_secs(5));
    Lobby::new(config, Arc::new(backend.clone()))
}

/// Poll `check` every 10ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StubOptions {
    /// Never answer `createGame`.
    pub ignore_create: bool,
}

pub struct StubLobby {
    pub url: String,
    task: JoinHandle<()>,
}

impl StubLobby {
    pub async fn start() -> Self {
        Self::start_with(StubOptions::default()).await
    }

    pub async fn start_with(options: StubOptions) -> Self {
        let state = StubState {
            registry: Arc::new(AsyncMutex::new(Registry::default())),
            options,
        };
        let app = Router::new().route("/", get(ws_handler)).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub lobby");
        let addr = listener.local_addr().expect("stub lobby addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            url: format!("ws://{addr}"),
            task,
        }
    }
}

impl Drop for StubLobby {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Outbox = mpsc::UnboundedSender<WsMessage>;

struct Game {
    host: String,
    server_name: String,
    player_amount: u64,
    max_players: u64,
    requires_password: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    conns: HashMap<String, Outbox>,
    games: HashMap<String, Game>,
    /// Joining connection -> game id.
    joined: HashMap<String, String>,
}

impl Registry {
    fn send_to(&self, conn: &str, value: Value) {
        if let Some(tx) = self.conns.get(conn) {
            send_json(tx, value);
        }
    }

    fn host_of(&self, game_id: &str) -> Option<String> {
        self.games.get(game_id).map(|game| game.host.clone())
    }
}

#[derive(Clone)]
struct StubState {
    registry: Arc<AsyncMutex<Registry>>,
    options: StubOptions,
}

fn send_json(tx: &Outbox, value: Value) {
    let _ = tx.send(WsMessage::Text(value.to_string()));
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<StubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: StubState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let conn_id = {
        let mut registry = state.registry.lock().await;
        registry.next_id += 1;
        let id = format!("peer-{}", registry.next_id);
        registry.conns.insert(id.clone(), tx.clone());
        id
    };

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    handle_message(&state, &conn_id, &tx, value).await;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let mut registry = state.registry.lock().await;
    registry.conns.remove(&conn_id);
    if let Some(game_id) = registry.joined.remove(&conn_id) {
        if let Some(host) = registry.host_of(&game_id) {
            debug!("stub: {conn_id} vanished from {game_id}");
            registry.send_to(&host, json!({ "type": "clientVanished", "clientId": conn_id }));
        }
    }
    registry.games.retain(|_, game| game.host != conn_id);
    drop(registry);
    send_task.abort();
}

async fn handle_message(state: &StubState, conn_id: &str, tx: &Outbox, value: Value) {
    let mut registry = state.registry.lock().await;
    match value.get("type").and_then(Value::as_str) {
        Some("createGame") => {
            if state.options.ignore_create {
                return;
            }
            registry.next_id += 1;
            let game_id = format!("game-{}", registry.next_id);
            registry.games.insert(
                game_id.clone(),
                Game {
                    host: conn_id.to_string(),
                    server_name: str_field(&value, "serverName"),
                    player_amount: 0,
                    max_players: value.get("maxPlayers").and_then(Value::as_u64).unwrap_or(0),
                    requires_password: value
                        .get("requiresPassword")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                },
            );
            send_json(tx, json!({ "type": "gameCreated", "gameId": game_id }));
        }
        Some("listGames") => {
            let games: Vec<Value> = registry
                .games
                .iter()
                .map(|(id, game)| {
                    json!({
                        "gameId": id,
                        "serverName": game.server_name,
                        "playerAmount": game.player_amount,
                        "maxPlayers": game.max_players,
                        "requiresPassword": game.requires_password,
                    })
                })
                .collect();
            send_json(tx, json!({ "type": "gameList", "games": games }));
        }
        Some("updateGameInfo") => {
            if let Some(game) = registry.games.values_mut().find(|game| game.host == conn_id) {
                game.server_name = str_field(&value, "serverName");
                game.player_amount = value.get("playerAmount").and_then(Value::as_u64).unwrap_or(0);
                game.max_players = value.get("maxPlayers").and_then(Value::as_u64).unwrap_or(0);
                game.requires_password = value
                    .get("requiresPassword")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
        }
        Some("joinGame") => {
            let game_id = str_field(&value, "gameId");
            let Some(host) = registry.host_of(&game_id) else {
                send_json(tx, json!({ "type": "error", "reason": "unknown game" }));
                return;
            };
            registry.joined.insert(conn_id.to_string(), game_id);
            let mut notice = json!({ "type": "newClient", "clientId": conn_id });
            if let Some(password) = value.get("password") {
                notice["password"] = password.clone();
            }
            registry.send_to(&host, notice);
        }
        Some("acceptJoin") | Some("rejectJoin") => {
            if let Some(client) = value.get("clientId").and_then(Value::as_str) {
                registry.send_to(client, value.clone());
            }
        }
        Some("webrtcSignaling") => {
            let from_client = registry.joined.get(conn_id).cloned();
            match from_client {
                Some(game_id) => {
                    if let Some(host) = registry.host_of(&game_id) {
                        let mut relayed = value.clone();
                        relayed["clientId"] = json!(conn_id);
                        registry.send_to(&host, relayed);
                    }
                }
                None => {
                    if let Some(client) = value.get("clientId").and_then(Value::as_str) {
                        registry.send_to(client, value.clone());
                    }
                }
            }
        }
        other => debug!("stub: ignoring {other:?} from {conn_id}"),
    }
}

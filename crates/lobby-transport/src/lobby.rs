use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::RtcBackend;
use crate::channel;
use crate::config::LobbyConfig;
use crate::error::{ChannelError, LobbyError, SignalingError};
use crate::message::{GameInfo, SignalKind, SignalMessage, encode_game_list};
use crate::negotiation::{self, handle_remote_signal, release};
use crate::peers::{ChannelState, LobbyMode, PeerTable, close_all};
use crate::signaling::{SignalingChannel, Subscription};

pub const REASON_FULL: &str = "Game is full";
pub const REASON_WRONG_PASSWORD: &str = "Wrong password";

/// Result of [`Lobby::connect_to_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Connected,
    Failed(String),
    UnexpectedReply,
    Rejected(String),
    Full,
    WrongPassword,
}

impl JoinOutcome {
    pub fn code(&self) -> i32 {
        match self {
            JoinOutcome::Connected => 0,
            JoinOutcome::Failed(_) => 1,
            JoinOutcome::UnexpectedReply => 2,
            JoinOutcome::Rejected(_) => 3,
            JoinOutcome::Full => 4,
            JoinOutcome::WrongPassword => 5,
        }
    }

    fn from_reason(reason: Option<&str>) -> Self {
        match reason {
            Some(REASON_FULL) => JoinOutcome::Full,
            Some(REASON_WRONG_PASSWORD) => JoinOutcome::WrongPassword,
            other => JoinOutcome::Rejected(other.unwrap_or_default().to_string()),
        }
    }
}

#[derive(Default)]
struct LobbySession {
    signaling: Option<Arc<SignalingChannel>>,
    game_id: Option<String>,
    server_password: Option<String>,
    games: Vec<GameInfo>,
    host_subscription: Option<Subscription>,
    host_task: Option<JoinHandle<()>>,
}

struct LobbyInner {
    config: LobbyConfig,
    backend: Arc<dyn RtcBackend>,
    table: Mutex<PeerTable>,
    session: Mutex<LobbySession>,
}

impl Drop for LobbyInner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(task) = session.host_task.take() {
            task.abort();
        }
        if let Some(signaling) = session.signaling.take() {
            signaling.close();
        }
    }
}

/// Hosts or joins one game at a time. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Lobby {
    inner: Arc<LobbyInner>,
}

fn non_empty(password: Option<&str>) -> Option<String> {
    password.filter(|p| !p.is_empty()).map(str::to_string)
}

impl Lobby {
    pub fn new(config: LobbyConfig, backend: Arc<dyn RtcBackend>) -> Self {
        let table = Mutex::new(PeerTable::new(config.max_peers));
        Self {
            inner: Arc::new(LobbyInner {
                config,
                backend,
                table,
                session: Mutex::new(LobbySession::default()),
            }),
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.inner.config
    }

    /// Open the lobby connection; a no-op while one is open.
    pub async fn connect_to_lobby(&self) -> Result<(), LobbyError> {
        self.signaling().await.map(|_| ())
    }

    async fn signaling(&self) -> Result<Arc<SignalingChannel>, LobbyError> {
        let existing = self.inner.session.lock().signaling.clone();
        if let Some(channel) = existing.filter(|channel| channel.is_open()) {
            return Ok(channel);
        }
        let url = &self.inner.config.lobby_url;
        let channel = SignalingChannel::connect(url, self.inner.config.connect_timeout).await?;
        tracing::info!(target = "lobby", url = %url, "connected to lobby");
        self.inner.session.lock().signaling = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Tear down every slot and flow subscription, then switch mode. The
    /// lobby connection survives unless `mode` is [`LobbyMode::None`].
    async fn reset_to(&self, mode: LobbyMode) {
        let evicted = self.inner.table.lock().reset(mode);
        let (signaling, host_task, host_subscription) = {
            let mut session = self.inner.session.lock();
            session.server_password = None;
            session.game_id = None;
            let signaling = if mode == LobbyMode::None {
                session.signaling.take()
            } else {
                session.signaling.clone()
            };
            (
                signaling,
                session.host_task.take(),
                session.host_subscription.take(),
            )
        };
        drop(host_subscription);
        if let Some(task) = host_task {
            task.abort();
        }
        if let Some(signaling) = signaling {
            signaling.clear_subscribers();
            if mode == LobbyMode::None {
                signaling.close();
            }
        }
        tracing::debug!(target = "lobby", mode = ?mode, evicted = evicted.len(), "lobby reset");
        close_all(evicted).await;
    }

    pub async fn reset(&self) {
        self.reset_to(LobbyMode::None).await;
    }

    /// Announce a game and start admitting joiners. Returns the lobby's game id.
    pub async fn create_server(
        &self,
        name: &str,
        capacity: u32,
        password: Option<&str>,
    ) -> Result<String, LobbyError> {
        self.reset_to(LobbyMode::Server).await;
        let password = non_empty(password);
        self.inner.session.lock().server_password = password.clone();

        match self.announce(name, capacity, password.is_some()).await {
            Ok(game_id) => {
                tracing::info!(target = "lobby", game_id = %game_id, name, capacity, "game created");
                Ok(game_id)
            }
            Err(err) => {
                tracing::warn!(target = "lobby", error = %err, "game creation failed");
                self.reset_to(LobbyMode::None).await;
                Err(err)
            }
        }
    }

    async fn announce(
        &self,
        name: &str,
        capacity: u32,
        requires_password: bool,
    ) -> Result<String, LobbyError> {
        let signaling = self.signaling().await?;

        // Buffer host traffic from the start so nothing sent right after
        // `gameCreated` is missed.
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = signaling.subscribe(move |message| {
            if matches!(
                message.kind(),
                SignalKind::NewClient
                    | SignalKind::WebrtcSignaling
                    | SignalKind::ClientVanished
                    | SignalKind::LobbyConnectionLost
            ) {
                let _ = tx.send(message.clone());
            }
        });

        let mut created = signaling.stream(&[SignalKind::GameCreated]);
        signaling.send(SignalMessage::CreateGame {
            server_name: name.to_string(),
            max_players: capacity,
            requires_password,
        });
        let game_id = match created.next(self.inner.config.create_timeout).await? {
            SignalMessage::GameCreated { game_id } => game_id,
            other => {
                return Err(SignalingError::Remote(format!(
                    "unexpected reply {:?}",
                    other.kind()
                ))
                .into());
            }
        };

        let task = tokio::spawn(host_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&signaling),
            rx,
        ));
        let mut session = self.inner.session.lock();
        session.game_id = Some(game_id.clone());
        session.host_subscription = Some(subscription);
        session.host_task = Some(task);
        Ok(game_id)
    }

    /// Push new game metadata and remember the password for admission.
    pub fn update_server(
        &self,
        name: &str,
        player_amount: u32,
        max_players: u32,
        password: Option<&str>,
    ) -> Result<(), LobbyError> {
        if !self.is_server() {
            return Err(LobbyError::NotHosting);
        }
        let password = non_empty(password);
        let requires_password = password.is_some();
        let signaling = {
            let mut session = self.inner.session.lock();
            session.server_password = password;
            session.signaling.clone()
        };
        let signaling = signaling
            .filter(|channel| channel.is_open())
            .ok_or(SignalingError::Closed)?;
        signaling.send(SignalMessage::UpdateGameInfo {
            server_name: name.to_string(),
            player_amount,
            max_players,
            requires_password,
        });
        Ok(())
    }

    /// Join a game and block until its data channel is open. The lobby
    /// connection is closed afterwards whatever the outcome; any outcome
    /// other than `Connected` also leaves the lobby unattached.
    pub async fn connect_to_server(&self, game_id: &str, password: Option<&str>) -> JoinOutcome {
        self.reset_to(LobbyMode::Client).await;
        let outcome = match self.join(game_id, password).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(target = "lobby", game_id, error = %err, "join failed");
                JoinOutcome::Failed(err.to_string())
            }
        };
        if outcome == JoinOutcome::Connected {
            let signaling = self.inner.session.lock().signaling.take();
            if let Some(signaling) = signaling {
                signaling.close();
            }
        } else {
            self.reset_to(LobbyMode::None).await;
        }
        tracing::info!(target = "lobby", game_id, code = outcome.code(), "join finished");
        outcome
    }

    async fn join(&self, game_id: &str, password: Option<&str>) -> Result<JoinOutcome, LobbyError> {
        let signaling = self.signaling().await?;
        let timeout = self.inner.config.join_timeout;

        let mut replies = signaling.stream(&[SignalKind::AcceptJoin, SignalKind::RejectJoin]);
        let mut traffic = signaling.stream(&[SignalKind::WebrtcSignaling, SignalKind::Connected]);
        signaling.send(SignalMessage::JoinGame {
            game_id: game_id.to_string(),
            password: non_empty(password),
        });

        let reply = replies.next(timeout).await?;
        drop(replies);
        match reply {
            SignalMessage::AcceptJoin { .. } => {
                tracing::debug!(target = "lobby", game_id, "join accepted");
            }
            SignalMessage::RejectJoin { reason, .. } => {
                tracing::info!(target = "lobby", game_id, reason = ?reason, "join rejected");
                return Ok(JoinOutcome::from_reason(reason.as_deref()));
            }
            other => {
                tracing::warn!(target = "lobby", kind = ?other.kind(), "unexpected join reply");
                return Ok(JoinOutcome::UnexpectedReply);
            }
        }

        let slot = negotiation::start(
            &self.inner.table,
            self.inner.backend.as_ref(),
            &signaling,
            None,
        )
        .await?;
        loop {
            match traffic.next(timeout).await? {
                SignalMessage::WebrtcSignaling {
                    description,
                    candidate,
                    ..
                } => handle_remote_signal(&slot, description, candidate, &signaling).await?,
                SignalMessage::Connected => break,
                _ => {}
            }
        }
        Ok(JoinOutcome::Connected)
    }

    /// Fetch the advertised games and remember them.
    pub async fn list_servers(&self) -> Result<Vec<GameInfo>, LobbyError> {
        match self.fetch_games().await {
            Ok(games) => {
                tracing::debug!(target = "lobby", count = games.len(), "game list received");
                self.inner.session.lock().games = games.clone();
                Ok(games)
            }
            Err(err) => {
                tracing::warn!(target = "lobby", error = %err, "listing games failed");
                // A host keeps its lobby connection; it still serves joiners.
                if !self.is_server() {
                    let signaling = self.inner.session.lock().signaling.take();
                    if let Some(signaling) = signaling {
                        signaling.close();
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_games(&self) -> Result<Vec<GameInfo>, LobbyError> {
        let signaling = self.signaling().await?;
        let mut listing = signaling.stream(&[SignalKind::GameList]);
        signaling.send(SignalMessage::ListGames);
        match listing.next(self.inner.config.list_timeout).await? {
            SignalMessage::GameList { games } => Ok(games),
            other => Err(SignalingError::Remote(format!("unexpected reply {:?}", other.kind())).into()),
        }
    }

    /// `id;name;amount;max;requiresPassword` entries joined by `|`.
    pub async fn list_servers_encoded(&self) -> Result<String, LobbyError> {
        Ok(encode_game_list(&self.list_servers().await?))
    }

    /// Games from the last successful listing.
    pub fn games(&self) -> Vec<GameInfo> {
        self.inner.session.lock().games.clone()
    }

    pub fn game_id(&self) -> Option<String> {
        self.inner.session.lock().game_id.clone()
    }

    pub fn mode(&self) -> LobbyMode {
        self.inner.table.lock().mode()
    }

    pub fn is_server(&self) -> bool {
        self.mode() == LobbyMode::Server
    }

    /// Whether the client slot has an open channel to its server.
    pub fn is_connected(&self) -> bool {
        self.inner
            .table
            .lock()
            .get(0)
            .is_some_and(|slot| slot.is_open())
    }

    pub fn has_peer(&self, index: usize) -> bool {
        self.inner.table.lock().get(index).is_some()
    }

    pub fn occupied_slots(&self) -> usize {
        self.inner.table.lock().occupied()
    }

    pub fn capacity(&self) -> usize {
        self.inner.table.lock().capacity()
    }

    pub async fn send(&self, index: usize, data: &[u8]) -> Result<usize, ChannelError> {
        let slot = self
            .inner
            .table
            .lock()
            .get(index)
            .ok_or(ChannelError::NotReady)?;
        channel::send(&slot, data).await
    }

    /// Poll one inbound message. A disconnected peer's slot is released.
    pub async fn receive(&self, index: usize) -> Result<Option<Bytes>, ChannelError> {
        let slot = self
            .inner
            .table
            .lock()
            .get(index)
            .ok_or(ChannelError::Disconnected)?;
        let result = channel::receive(&slot);
        if result == Err(ChannelError::Disconnected) {
            tracing::debug!(target = "lobby", slot = index, "peer gone");
            release(&self.inner.table, &slot).await;
        }
        result
    }

    /// Like [`Lobby::receive`], copying into `buf`; `Ok(0)` means empty.
    pub async fn receive_into(&self, index: usize, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let slot = self
            .inner
            .table
            .lock()
            .get(index)
            .ok_or(ChannelError::Disconnected)?;
        let result = channel::receive_into(&slot, buf);
        if result == Err(ChannelError::Disconnected) {
            tracing::debug!(target = "lobby", slot = index, "peer gone");
            release(&self.inner.table, &slot).await;
        }
        result
    }
}

async fn host_loop(
    inner: Weak<LobbyInner>,
    signaling: Arc<SignalingChannel>,
    mut rx: mpsc::UnboundedReceiver<SignalMessage>,
) {
    while let Some(message) = rx.recv().await {
        let Some(lobby) = inner.upgrade() else {
            break;
        };
        match message {
            SignalMessage::NewClient {
                client_id,
                password,
            } => admit(&lobby, &signaling, client_id, password).await,
            SignalMessage::WebrtcSignaling {
                client_id,
                description,
                candidate,
            } => {
                let slot = lobby.table.lock().find(client_id.as_deref());
                let Some(slot) = slot else {
                    tracing::debug!(target = "lobby", client_id = ?client_id, "signal for unknown peer");
                    continue;
                };
                if let Err(err) = handle_remote_signal(&slot, description, candidate, &signaling).await
                {
                    tracing::warn!(
                        target = "webrtc",
                        slot = slot.index(),
                        peer_id = ?slot.peer_id(),
                        error = %err,
                        "negotiation failed; releasing slot"
                    );
                    release(&lobby.table, &slot).await;
                }
            }
            SignalMessage::ClientVanished { client_id } => {
                let slot = lobby.table.lock().find(Some(&client_id));
                match slot {
                    Some(slot) if slot.channel_state() == ChannelState::Pending => {
                        tracing::debug!(target = "lobby", client_id = %client_id, "client vanished mid-negotiation");
                        release(&lobby.table, &slot).await;
                    }
                    _ => {}
                }
            }
            SignalMessage::LobbyConnectionLost => {
                tracing::warn!(target = "lobby", "lobby connection lost while hosting");
            }
            _ => {}
        }
    }
}

/// Capacity is checked before the password.
async fn admit(
    inner: &LobbyInner,
    signaling: &Arc<SignalingChannel>,
    client_id: String,
    password: Option<String>,
) {
    let (game_id, expected) = {
        let session = inner.session.lock();
        (
            session.game_id.clone().unwrap_or_default(),
            session.server_password.clone(),
        )
    };
    let has_free_slot = inner.table.lock().has_free_slot();
    let rejection = if !has_free_slot {
        Some(REASON_FULL)
    } else if expected.is_some() && expected != non_empty(password.as_deref()) {
        Some(REASON_WRONG_PASSWORD)
    } else {
        None
    };

    if let Some(reason) = rejection {
        tracing::info!(target = "lobby", client_id = %client_id, reason, "rejecting join");
        signaling.send(SignalMessage::RejectJoin {
            game_id,
            client_id: Some(client_id),
            reason: Some(reason.to_string()),
        });
        return;
    }

    tracing::info!(target = "lobby", client_id = %client_id, "admitting peer");
    signaling.send(SignalMessage::AcceptJoin {
        game_id,
        client_id: Some(client_id.clone()),
    });
    if let Err(err) = negotiation::start(
        &inner.table,
        inner.backend.as_ref(),
        signaling,
        Some(client_id.clone()),
    )
    .await
    {
        tracing::warn!(target = "lobby", client_id = %client_id, error = %err, "could not start negotiation");
    }
}

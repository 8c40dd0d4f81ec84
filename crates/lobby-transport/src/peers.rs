use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::backend::{DataChannel, RtcConnection};
use crate::channel::InboundQueue;
use crate::error::SlotError;

/// What the local node currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LobbyMode {
    #[default]
    None,
    Server,
    Client,
}

/// Collision behaviour of one side of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Yields on collision (rolls back its own offer).
    Polite,
    /// Wins collisions by ignoring the remote offer.
    Impolite,
}

impl NegotiationRole {
    pub fn for_mode(mode: LobbyMode) -> Self {
        match mode {
            LobbyMode::Server => NegotiationRole::Impolite,
            LobbyMode::Client | LobbyMode::None => NegotiationRole::Polite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Open,
    Closed,
}

struct SlotState {
    negotiation: NegotiationState,
    channel_state: ChannelState,
    channel: Option<Arc<dyn DataChannel>>,
}

/// One remote peer: its connection, data channel and negotiation flags.
pub struct PeerSlot {
    index: usize,
    peer_id: Option<String>,
    role: NegotiationRole,
    connection: Arc<dyn RtcConnection>,
    pub(crate) making_offer: AtomicBool,
    pub(crate) ignore_offer: AtomicBool,
    /// Held for each negotiation step so steps on one connection never interleave.
    pub(crate) negotiation_lock: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
    inbound: InboundQueue,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSlot {
    pub(crate) fn new(
        index: usize,
        peer_id: Option<String>,
        role: NegotiationRole,
        connection: Arc<dyn RtcConnection>,
    ) -> Self {
        Self {
            index,
            peer_id,
            role,
            connection,
            making_offer: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
            negotiation_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                negotiation: NegotiationState::Negotiating,
                channel_state: ChannelState::Pending,
                channel: None,
            }),
            inbound: InboundQueue::default(),
            driver: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Lobby-assigned client id; `None` for the single client-side slot.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn polite(&self) -> bool {
        self.role == NegotiationRole::Polite
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    pub fn channel_state(&self) -> ChannelState {
        self.state.lock().channel_state
    }

    pub fn is_open(&self) -> bool {
        self.channel_state() == ChannelState::Open
    }

    pub(crate) fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub(crate) fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        let mut state = self.state.lock();
        if state.channel_state != ChannelState::Closed {
            state.channel = Some(channel);
        }
    }

    /// The channel, once it has reported open.
    pub(crate) fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let state = self.state.lock();
        match state.channel_state {
            ChannelState::Open => state.channel.clone(),
            _ => None,
        }
    }

    /// Returns `true` on the transition into `Open`.
    pub(crate) fn mark_open(&self) -> bool {
        let mut state = self.state.lock();
        if state.channel_state != ChannelState::Pending || state.channel.is_none() {
            return false;
        }
        state.channel_state = ChannelState::Open;
        state.negotiation = NegotiationState::Connected;
        true
    }

    pub(crate) fn mark_closed(&self) {
        let mut state = self.state.lock();
        state.channel_state = ChannelState::Closed;
        state.negotiation = NegotiationState::Closed;
    }

    pub(crate) fn set_driver(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.driver.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Tear down the connection. Safe to call more than once.
    pub async fn close(&self) {
        let driver = self.driver.lock().take();
        if let Some(handle) = driver {
            handle.abort();
        }
        let channel = {
            let mut state = self.state.lock();
            state.channel_state = ChannelState::Closed;
            state.negotiation = NegotiationState::Closed;
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.connection.close().await;
        tracing::debug!(target = "webrtc", slot = self.index, peer_id = ?self.peer_id, "peer slot closed");
    }
}

/// Fixed-capacity table of peer slots.
pub struct PeerTable {
    mode: LobbyMode,
    slots: Vec<Option<Arc<PeerSlot>>>,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            mode: LobbyMode::None,
            slots: vec![None; max_peers],
        }
    }

    pub fn mode(&self) -> LobbyMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Empty every slot and switch mode. The evicted slots are returned so
    /// the caller can close them without holding the table.
    pub fn reset(&mut self, mode: LobbyMode) -> Vec<Arc<PeerSlot>> {
        self.mode = mode;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Place a new peer in the lowest free index.
    pub fn allocate(
        &mut self,
        peer_id: Option<String>,
        connection: Arc<dyn RtcConnection>,
    ) -> Result<Arc<PeerSlot>, SlotError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SlotError::Full)?;
        let role = NegotiationRole::for_mode(self.mode);
        let slot = Arc::new(PeerSlot::new(index, peer_id, role, connection));
        self.slots[index] = Some(Arc::clone(&slot));
        Ok(slot)
    }

    /// A client only ever has one peer, so the id is ignored in that mode.
    pub fn find(&self, peer_id: Option<&str>) -> Option<Arc<PeerSlot>> {
        if self.mode == LobbyMode::Client {
            return self.slots.first().cloned().flatten();
        }
        let peer_id = peer_id?;
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.peer_id() == Some(peer_id))
            .cloned()
    }

    pub fn get(&self, index: usize) -> Option<Arc<PeerSlot>> {
        self.slots.get(index).cloned().flatten()
    }

    /// Vacate the slot if it still holds this exact peer.
    pub fn remove(&mut self, slot: &Arc<PeerSlot>) -> bool {
        let Some(entry) = self.slots.get_mut(slot.index()) else {
            return false;
        };
        if entry.as_ref().is_some_and(|current| Arc::ptr_eq(current, slot)) {
            *entry = None;
            true
        } else {
            false
        }
    }
}

pub(crate) async fn close_all(slots: Vec<Arc<PeerSlot>>) {
    for slot in slots {
        slot.close().await;
    }
}

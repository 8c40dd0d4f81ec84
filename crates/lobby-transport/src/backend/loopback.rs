//! In-process backend: every connection created from clones of one
//! [`LoopbackBackend`] lives on the same simulated network. Descriptions
//! carry the connection id, and two connections link once each holds the
//! other's description in a stable state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{DataChannel, PeerEvent, PeerEventSender, RtcBackend, RtcConnection, SignalingState};
use crate::error::{ChannelError, NegotiationError};
use crate::message::{IceCandidate, SdpKind, SessionDescription};

const SDP_PREFIX: &str = "loopback ";

#[derive(Clone, Default)]
pub struct LoopbackBackend {
    network: Arc<Network>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections currently registered on the network.
    pub fn live_connections(&self) -> usize {
        self.network.state.lock().peers.len()
    }
}

#[derive(Default)]
struct Network {
    state: Mutex<NetworkState>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    peers: HashMap<u64, PeerRecord>,
    channels: HashMap<u64, ChannelRecord>,
}

struct PeerRecord {
    events: PeerEventSender,
    signaling: SignalingState,
    remote: Option<u64>,
    linked: bool,
}

struct ChannelRecord {
    owner: u64,
    label: String,
    open: bool,
    peer: Option<u64>,
}

impl NetworkState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&self, peer: u64, event: PeerEvent) {
        if let Some(record) = self.peers.get(&peer) {
            let _ = record.events.send(event);
        }
    }

    fn peer_mut(&mut self, id: u64) -> Result<&mut PeerRecord, NegotiationError> {
        self.peers
            .get_mut(&id)
            .ok_or_else(|| NegotiationError::Backend("connection closed".into()))
    }

    fn linkable(&self, id: u64) -> Option<u64> {
        let local = self.peers.get(&id)?;
        let remote_id = local.remote?;
        let remote = self.peers.get(&remote_id)?;
        let both_stable = local.signaling == SignalingState::Stable
            && remote.signaling == SignalingState::Stable;
        (both_stable && remote.remote == Some(id)).then_some(remote_id)
    }

    fn try_link(&mut self, network: &Arc<Network>, id: u64) {
        let Some(remote_id) = self.linkable(id) else {
            return;
        };
        for side in [id, remote_id] {
            if let Some(record) = self.peers.get_mut(&side) {
                record.linked = true;
            }
        }
        self.pair_channels(network, id, remote_id);
        self.pair_channels(network, remote_id, id);
    }

    /// Give every unpaired channel owned by `owner` a counterpart on `other`.
    fn pair_channels(&mut self, network: &Arc<Network>, owner: u64, other: u64) {
        let unpaired: Vec<(u64, String)> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.owner == owner && channel.peer.is_none())
            .map(|(id, channel)| (*id, channel.label.clone()))
            .collect();
        for (local_id, label) in unpaired {
            let remote_channel = self.allocate_id();
            self.channels.insert(
                remote_channel,
                ChannelRecord {
                    owner: other,
                    label: label.clone(),
                    open: true,
                    peer: Some(local_id),
                },
            );
            if let Some(channel) = self.channels.get_mut(&local_id) {
                channel.open = true;
                channel.peer = Some(remote_channel);
            }
            let handle: Arc<dyn DataChannel> = Arc::new(LoopbackChannel {
                id: remote_channel,
                label,
                network: Arc::clone(network),
            });
            self.emit(other, PeerEvent::DataChannel(handle));
            self.emit(other, PeerEvent::ChannelOpen);
            self.emit(owner, PeerEvent::ChannelOpen);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open && channel.peer.is_none() {
            return;
        }
        let was_open = channel.open;
        channel.open = false;
        let owner = channel.owner;
        let peer = channel.peer.take();
        if was_open {
            self.emit(owner, PeerEvent::ChannelClosed);
        }
        if let Some(peer_id) = peer {
            self.close_channel(peer_id);
        }
    }
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn create_connection(
        &self,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcConnection>, NegotiationError> {
        let mut state = self.network.state.lock();
        let id = state.allocate_id();
        state.peers.insert(
            id,
            PeerRecord {
                events,
                signaling: SignalingState::Stable,
                remote: None,
                linked: false,
            },
        );
        tracing::trace!(target = "webrtc", connection = id, "loopback connection created");
        Ok(Arc::new(LoopbackConnection {
            id,
            network: Arc::clone(&self.network),
        }))
    }
}

struct LoopbackConnection {
    id: u64,
    network: Arc<Network>,
}

fn parse_sdp(description: &SessionDescription) -> Result<u64, NegotiationError> {
    description
        .sdp
        .strip_prefix(SDP_PREFIX)
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(|| NegotiationError::Backend(format!("unrecognized sdp: {}", description.sdp)))
}

#[async_trait]
impl RtcConnection for LoopbackConnection {
    async fn set_local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.network.state.lock();
        let record = state.peer_mut(self.id)?;
        let sdp = format!("{SDP_PREFIX}{}", self.id);
        let description = match record.signaling {
            SignalingState::Stable => {
                record.signaling = SignalingState::HaveLocalOffer;
                SessionDescription::offer(sdp)
            }
            SignalingState::HaveRemoteOffer => {
                record.signaling = SignalingState::Stable;
                SessionDescription::answer(sdp)
            }
            other => {
                return Err(NegotiationError::Backend(format!(
                    "cannot create a description in {other:?}"
                )));
            }
        };
        state.emit(
            self.id,
            PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{} 1 loopback", self.id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        );
        state.try_link(&self.network, self.id);
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut state = self.network.state.lock();
        let record = state.peer_mut(self.id)?;
        match description.kind {
            SdpKind::Rollback => {
                record.signaling = SignalingState::Stable;
                return Ok(());
            }
            SdpKind::Offer => {
                let remote = parse_sdp(&description)?;
                match record.signaling {
                    // Implicit rollback of our own offer.
                    SignalingState::Stable | SignalingState::HaveLocalOffer => {
                        record.signaling = SignalingState::HaveRemoteOffer;
                        record.remote = Some(remote);
                    }
                    other => {
                        return Err(NegotiationError::Backend(format!(
                            "remote offer rejected in {other:?}"
                        )));
                    }
                }
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                let remote = parse_sdp(&description)?;
                if record.signaling != SignalingState::HaveLocalOffer {
                    return Err(NegotiationError::Backend(format!(
                        "answer rejected in {:?}",
                        record.signaling
                    )));
                }
                record.signaling = SignalingState::Stable;
                record.remote = Some(remote);
            }
        }
        state.try_link(&self.network, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.network.state.lock();
        state.peer_mut(self.id).map(|_| ())
    }

    fn signaling_state(&self) -> SignalingState {
        self.network
            .state
            .lock()
            .peers
            .get(&self.id)
            .map(|record| record.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let mut state = self.network.state.lock();
        let linked = state.peer_mut(self.id)?.linked;
        let remote = state.peers.get(&self.id).and_then(|record| record.remote);
        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelRecord {
                owner: self.id,
                label: label.to_string(),
                open: false,
                peer: None,
            },
        );
        match (linked, remote) {
            (true, Some(remote)) => state.pair_channels(&self.network, self.id, remote),
            _ => state.emit(self.id, PeerEvent::NegotiationNeeded),
        }
        Ok(Arc::new(LoopbackChannel {
            id,
            label: label.to_string(),
            network: Arc::clone(&self.network),
        }))
    }

    async fn close(&self) {
        let mut state = self.network.state.lock();
        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, channel)| channel.owner == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            state.close_channel(*id);
        }
        for id in owned {
            state.channels.remove(&id);
        }
        state.peers.remove(&self.id);
        tracing::trace!(target = "webrtc", connection = self.id, "loopback connection closed");
    }
}

struct LoopbackChannel {
    id: u64,
    label: String,
    network: Arc<Network>,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.network
            .state
            .lock()
            .channels
            .get(&self.id)
            .map(|channel| channel.open)
            .unwrap_or(false)
    }

    async fn send(&self, data: Bytes) -> Result<usize, ChannelError> {
        let state = self.network.state.lock();
        let channel = state.channels.get(&self.id).ok_or(ChannelError::NotReady)?;
        if !channel.open {
            return Err(ChannelError::NotReady);
        }
        let peer_owner = channel
            .peer
            .and_then(|peer| state.channels.get(&peer))
            .map(|peer| peer.owner)
            .ok_or(ChannelError::Disconnected)?;
        let len = data.len();
        state.emit(peer_owner, PeerEvent::ChannelMessage(data));
        Ok(len)
    }

    async fn close(&self) {
        self.network.state.lock().close_channel(self.id);
    }
}

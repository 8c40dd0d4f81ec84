//! Opaque peer-connection capability.
//!
//! The negotiation engine only ever talks to these traits; the real
//! implementation is [`webrtc::WebRtcBackend`] and tests run against the
//! in-process [`loopback::LoopbackBackend`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ChannelError, NegotiationError};
use crate::message::{IceCandidate, SessionDescription};

pub mod loopback;
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Events a connection reports to its owning slot.
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    NegotiationNeeded,
    /// The remote side opened a channel towards us.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::ChannelOpen => f.write_str("ChannelOpen"),
            PeerEvent::ChannelMessage(bytes) => {
                f.debug_tuple("ChannelMessage").field(&bytes.len()).finish()
            }
            PeerEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn create_connection(
        &self,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcConnection>, NegotiationError>;
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Produce and apply the description the current state calls for: an
    /// offer when stable, an answer after a remote offer.
    async fn set_local_description(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote description. A remote offer received while holding a
    /// local offer rolls the local one back first.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    fn signaling_state(&self) -> SignalingState;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    /// Returns the number of bytes accepted.
    async fn send(&self, data: Bytes) -> Result<usize, ChannelError>;

    async fn close(&self);
}

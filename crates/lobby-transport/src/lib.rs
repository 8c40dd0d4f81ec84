//! Peer-to-peer session setup over a rendezvous lobby.
//!
//! A [`Lobby`] hosts a game (one impolite server with up to `max_peers`
//! joiners) or joins one (a single polite client slot). Connection setup is
//! relayed through the lobby websocket until a direct data channel is open;
//! from then on the application polls each slot with [`Lobby::receive`] and
//! writes with [`Lobby::send`].

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod lobby;
pub mod message;
pub mod negotiation;
pub mod peers;
pub mod signaling;

pub use backend::loopback::LoopbackBackend;
pub use backend::webrtc::WebRtcBackend;
pub use backend::{DataChannel, PeerEvent, RtcBackend, RtcConnection, SignalingState};
pub use config::LobbyConfig;
pub use error::{ChannelError, LobbyError, NegotiationError, SignalingError, SlotError};
pub use lobby::{JoinOutcome, Lobby};
pub use message::{GameInfo, IceCandidate, SdpKind, SessionDescription, SignalKind, SignalMessage};
pub use peers::{ChannelState, LobbyMode, NegotiationRole, NegotiationState, PeerSlot, PeerTable};
pub use signaling::{SignalStream, SignalingChannel, Subscription};

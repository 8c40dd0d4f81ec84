use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("lobby connection failed: {0}")]
    Connection(String),
    #[error("no lobby reply within {0:?}")]
    Timeout(Duration),
    #[error("lobby reported an error: {0}")]
    Remote(String),
    #[error("lobby connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("webrtc negotiation failed: {0}")]
    Backend(String),
    #[error("connection produced no local description")]
    MissingDescription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("all peer slots are occupied")]
    Full,
    #[error("no peer slot matches")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("data channel is not open")]
    NotReady,
    #[error("data channel rejected the write: {0}")]
    SendFailure(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("message of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
}

impl ChannelError {
    /// Numeric code handed to polling loops in place of a byte count.
    pub fn code(&self) -> i32 {
        match self {
            ChannelError::NotReady => -1,
            ChannelError::SendFailure(_) => -2,
            ChannelError::Disconnected => -1,
            ChannelError::BufferTooSmall { .. } => -3,
        }
    }
}

#[derive(Debug, Error)]
pub enum LobbyError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("not hosting a game")]
    NotHosting,
    #[error("invalid lobby config: {0}")]
    InvalidConfig(String),
}

impl LobbyError {
    /// Flow outcome code: every failure of a lobby flow collapses to `1`.
    pub fn code(&self) -> i32 {
        1
    }
}

pub(crate) fn to_backend_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Backend(err.to_string())
}

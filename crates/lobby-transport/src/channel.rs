//! Per-slot data-channel I/O: an inbound queue filled by the slot's driver
//! and drained by the polling application.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::peers::{ChannelState, PeerSlot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Bytes),
    /// The channel closed; everything queued before it is still delivered.
    Closed,
}

#[derive(Default)]
pub struct InboundQueue {
    items: Mutex<VecDeque<Inbound>>,
}

impl InboundQueue {
    pub fn push_message(&self, bytes: Bytes) {
        self.items.lock().push_back(Inbound::Message(bytes));
    }

    pub fn push_closed(&self) {
        let mut items = self.items.lock();
        if items.back() != Some(&Inbound::Closed) {
            items.push_back(Inbound::Closed);
        }
    }

    pub fn pop(&self) -> Option<Inbound> {
        self.items.lock().pop_front()
    }

    fn peek_len(&self) -> Option<Option<usize>> {
        self.items.lock().front().map(|item| match item {
            Inbound::Message(bytes) => Some(bytes.len()),
            Inbound::Closed => None,
        })
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Write one message to the slot's channel.
pub async fn send(slot: &PeerSlot, data: &[u8]) -> Result<usize, ChannelError> {
    let Some(channel) = slot.open_channel() else {
        return Err(ChannelError::NotReady);
    };
    if !channel.is_open() {
        return Err(ChannelError::NotReady);
    }
    let written = channel.send(Bytes::copy_from_slice(data)).await?;
    if written != data.len() {
        return Err(ChannelError::SendFailure(format!(
            "short write: {written} of {} bytes",
            data.len()
        )));
    }
    tracing::trace!(target = "webrtc", slot = slot.index(), len = written, "sent frame");
    Ok(written)
}

/// Pop the oldest inbound message. `Ok(None)` means nothing is waiting;
/// [`ChannelError::Disconnected`] means the peer is gone and the slot should
/// be released.
pub fn receive(slot: &PeerSlot) -> Result<Option<Bytes>, ChannelError> {
    match slot.inbound().pop() {
        Some(Inbound::Message(bytes)) => Ok(Some(bytes)),
        Some(Inbound::Closed) => Err(ChannelError::Disconnected),
        None if slot.channel_state() == ChannelState::Closed => Err(ChannelError::Disconnected),
        None => Ok(None),
    }
}

/// Copy the oldest inbound message into `buf`. A message larger than `buf`
/// stays queued and is reported as [`ChannelError::BufferTooSmall`].
pub fn receive_into(slot: &PeerSlot, buf: &mut [u8]) -> Result<usize, ChannelError> {
    match slot.inbound().peek_len() {
        Some(Some(needed)) if needed > buf.len() => {
            return Err(ChannelError::BufferTooSmall {
                needed,
                capacity: buf.len(),
            });
        }
        _ => {}
    }
    match receive(slot)? {
        Some(bytes) => {
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{ScriptedChannel, ScriptedConnection};
    use crate::peers::NegotiationRole;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn slot_with(channel: Arc<ScriptedChannel>) -> PeerSlot {
        let slot = PeerSlot::new(0, Some("c-1".into()), NegotiationRole::Impolite, ScriptedConnection::new());
        slot.attach_channel(channel);
        slot
    }

    #[tokio::test]
    async fn send_requires_an_open_channel() {
        let channel = ScriptedChannel::opened();
        let slot = slot_with(Arc::clone(&channel));
        assert_eq!(send(&slot, b"hi").await, Err(ChannelError::NotReady));

        slot.mark_open();
        assert_eq!(send(&slot, b"hi").await, Ok(2));
        assert_eq!(channel.sent.lock().len(), 1);

        channel.reject.store(true, Ordering::SeqCst);
        assert_eq!(send(&slot, b"hi").await.map_err(|e| e.code()), Err(-2));
    }

    #[test]
    fn queue_drains_in_order_then_reports_disconnect() {
        let slot = slot_with(ScriptedChannel::opened());
        slot.inbound().push_message(Bytes::from_static(b"one"));
        slot.inbound().push_message(Bytes::from_static(b"two"));
        slot.inbound().push_closed();
        slot.inbound().push_closed();
        assert_eq!(slot.inbound().len(), 3);

        assert_eq!(receive(&slot).unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(receive(&slot).unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(receive(&slot), Err(ChannelError::Disconnected));
        assert!(slot.inbound().is_empty());
    }

    #[test]
    fn empty_queue_on_live_slot_is_not_an_error() {
        let slot = slot_with(ScriptedChannel::opened());
        assert!(slot.inbound().is_empty());
        assert_eq!(receive(&slot), Ok(None));
        let mut buf = [0u8; 4];
        assert_eq!(receive_into(&slot, &mut buf), Ok(0));
    }

    #[test]
    fn oversized_message_stays_queued() {
        let slot = slot_with(ScriptedChannel::opened());
        slot.inbound().push_message(Bytes::from_static(b"abcdef"));

        let mut small = [0u8; 4];
        assert_eq!(
            receive_into(&slot, &mut small),
            Err(ChannelError::BufferTooSmall {
                needed: 6,
                capacity: 4
            })
        );
        let mut big = [0u8; 16];
        assert_eq!(receive_into(&slot, &mut big), Ok(6));
        assert_eq!(&big[..6], b"abcdef");
    }
}

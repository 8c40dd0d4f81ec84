//! Perfect negotiation over the lobby relay.
//!
//! Each slot gets a driver task consuming its connection's [`PeerEvent`]s.
//! The server side is impolite and opens the data channel; the client side
//! is polite and yields when offers collide.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{PeerEvent, RtcBackend, SignalingState};
use crate::error::{LobbyError, NegotiationError};
use crate::message::{IceCandidate, SessionDescription, SignalMessage};
use crate::peers::{NegotiationRole, PeerSlot, PeerTable};
use crate::signaling::SignalingChannel;

pub const DATA_CHANNEL_LABEL: &str = "data";

/// Create a connection for `peer_id`, place it in the table and start its
/// driver. The impolite side also opens the data channel, which kicks off
/// the first offer.
pub async fn start(
    table: &Mutex<PeerTable>,
    backend: &dyn RtcBackend,
    signaling: &Arc<SignalingChannel>,
    peer_id: Option<String>,
) -> Result<Arc<PeerSlot>, LobbyError> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connection = backend.create_connection(events_tx).await?;

    let allocated = table.lock().allocate(peer_id, Arc::clone(&connection));
    let slot = match allocated {
        Ok(slot) => slot,
        Err(err) => {
            connection.close().await;
            return Err(err.into());
        }
    };
    tracing::debug!(
        target = "webrtc",
        slot = slot.index(),
        peer_id = ?slot.peer_id(),
        role = ?slot.role(),
        "starting negotiation"
    );

    let driver = tokio::spawn(drive(
        Arc::downgrade(&slot),
        events_rx,
        Arc::clone(signaling),
    ));
    slot.set_driver(driver);

    if slot.role() == NegotiationRole::Impolite {
        match connection.create_data_channel(DATA_CHANNEL_LABEL).await {
            Ok(channel) => slot.attach_channel(channel),
            Err(err) => {
                release(table, &slot).await;
                return Err(err.into());
            }
        }
    }
    Ok(slot)
}

/// Vacate the slot (if it is still the occupant) and close it.
pub(crate) async fn release(table: &Mutex<PeerTable>, slot: &Arc<PeerSlot>) {
    let removed = table.lock().remove(slot);
    if removed {
        tracing::debug!(target = "webrtc", slot = slot.index(), "releasing peer slot");
    }
    slot.close().await;
}

async fn drive(
    slot: Weak<PeerSlot>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    signaling: Arc<SignalingChannel>,
) {
    while let Some(event) = events.recv().await {
        let Some(slot) = slot.upgrade() else {
            break;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                signaling.send(SignalMessage::WebrtcSignaling {
                    client_id: slot.peer_id().map(str::to_string),
                    description: None,
                    candidate: Some(candidate),
                });
            }
            PeerEvent::NegotiationNeeded => {
                if let Err(err) = make_offer(&slot, &signaling).await {
                    tracing::warn!(target = "webrtc", slot = slot.index(), error = %err, "offer failed");
                }
            }
            PeerEvent::DataChannel(channel) => {
                tracing::debug!(target = "webrtc", slot = slot.index(), label = %channel.label(), "data channel received");
                slot.attach_channel(channel);
            }
            PeerEvent::ChannelOpen => {
                if slot.mark_open() {
                    tracing::info!(target = "webrtc", slot = slot.index(), peer_id = ?slot.peer_id(), "peer connected");
                    if slot.polite() {
                        signaling.dispatch_local(SignalMessage::Connected);
                    }
                }
            }
            PeerEvent::ChannelMessage(bytes) => {
                tracing::trace!(target = "webrtc", slot = slot.index(), frame_len = bytes.len(), "queued frame");
                slot.inbound().push_message(bytes);
            }
            PeerEvent::ChannelClosed => {
                tracing::debug!(target = "webrtc", slot = slot.index(), "data channel closed by peer");
                slot.mark_closed();
                slot.inbound().push_closed();
            }
        }
    }
}

/// Produce and relay a fresh offer; `making_offer` is set while the local
/// description is applied and sent.
pub(crate) async fn make_offer(
    slot: &PeerSlot,
    signaling: &SignalingChannel,
) -> Result<(), NegotiationError> {
    let _step = slot.negotiation_lock.lock().await;
    slot.making_offer.store(true, Ordering::SeqCst);
    let result = slot
        .connection()
        .set_local_description()
        .await
        .map(|description| {
            signaling.send(SignalMessage::WebrtcSignaling {
                client_id: slot.peer_id().map(str::to_string),
                description: Some(description),
                candidate: None,
            });
        });
    slot.making_offer.store(false, Ordering::SeqCst);
    result
}

/// Apply a relayed description and/or candidate to the slot.
pub async fn handle_remote_signal(
    slot: &PeerSlot,
    description: Option<SessionDescription>,
    candidate: Option<IceCandidate>,
    signaling: &SignalingChannel,
) -> Result<(), NegotiationError> {
    let _step = slot.negotiation_lock.lock().await;
    if let Some(description) = description {
        let is_offer = description.is_offer();
        let collision = is_offer
            && (slot.making_offer.load(Ordering::SeqCst)
                || slot.connection().signaling_state() != SignalingState::Stable);
        let ignore = !slot.polite() && collision;
        slot.ignore_offer.store(ignore, Ordering::SeqCst);
        if ignore {
            tracing::debug!(target = "webrtc", slot = slot.index(), "ignoring colliding offer");
            return Ok(());
        }

        slot.connection().set_remote_description(description).await?;
        if is_offer {
            let answer = slot.connection().set_local_description().await?;
            signaling.send(SignalMessage::WebrtcSignaling {
                client_id: slot.peer_id().map(str::to_string),
                description: Some(answer),
                candidate: None,
            });
        }
    }

    if let Some(candidate) = candidate {
        if let Err(err) = slot.connection().add_ice_candidate(candidate).await {
            if !slot.ignore_offer.load(Ordering::SeqCst) {
                return Err(err);
            }
            tracing::trace!(target = "webrtc", slot = slot.index(), "dropping candidate for ignored offer");
        }
    }
    Ok(())
}

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{DataChannel, PeerEvent, PeerEventSender, RtcBackend, RtcConnection, SignalingState};
use crate::config::LobbyConfig;
use crate::error::{ChannelError, NegotiationError, to_backend_error};
use crate::message::{IceCandidate, SdpKind, SessionDescription};

/// Upper bound on queued outbound bytes before sends are refused.
const MAX_BUFFERED_AMOUNT: usize = 16 * 1024 * 1024;

pub struct WebRtcBackend {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, NegotiationError> {
        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }]
        };
        Ok(Self {
            api: build_api()?,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    pub fn from_config(config: &LobbyConfig) -> Result<Self, NegotiationError> {
        Self::new(config.ice_servers.clone())
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_backend_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_backend_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    async fn create_connection(
        &self,
        events: PeerEventSender,
    ) -> Result<Arc<dyn RtcConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(to_backend_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering; nothing to relay.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let negotiation_events = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let events = negotiation_events.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::NegotiationNeeded);
            })
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel announced");
                let _ = events.send(PeerEvent::DataChannel(Arc::new(WebRtcDataChannel {
                    inner: Arc::clone(&dc),
                })));
                attach_channel_handlers(&dc, events);
            })
        }));

        Ok(Arc::new(WebRtcConnection { pc, events }))
    }
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, events: PeerEventSender) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel opened");
            let _ = open_events.send(PeerEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            tracing::trace!(target = "webrtc", frame_len = msg.data.len(), "received frame");
            let _ = events.send(PeerEvent::ChannelMessage(msg.data));
        })
    }));

    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            tracing::warn!(target = "webrtc", error = %err, "data channel error");
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            let _ = events.send(PeerEvent::ChannelClosed);
        })
    }));

    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = events.send(PeerEvent::ChannelOpen);
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

impl WebRtcConnection {
    async fn rollback(&self) -> Result<(), NegotiationError> {
        let pending = self
            .pc
            .pending_local_description()
            .await
            .map(|description| description.sdp)
            .unwrap_or_default();
        let rollback: RTCSessionDescription =
            serde_json::from_value(json!({ "type": "rollback", "sdp": pending }))
                .map_err(to_backend_error)?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_backend_error)
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(to_backend_error),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(to_backend_error),
        SdpKind::Pranswer => {
            RTCSessionDescription::pranswer(description.sdp).map_err(to_backend_error)
        }
        SdpKind::Rollback => Err(NegotiationError::Backend(
            "remote rollback descriptions are not applied".into(),
        )),
    }
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return Err(NegotiationError::MissingDescription),
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn set_local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let description = match self.pc.signaling_state() {
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => self
                .pc
                .create_answer(None)
                .await
                .map_err(to_backend_error)?,
            _ => self.pc.create_offer(None).await.map_err(to_backend_error)?,
        };
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_backend_error)?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingDescription)?;
        from_rtc_description(local)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if description.is_offer() && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            tracing::debug!(target = "webrtc", "rolling back local offer");
            self.rollback().await?;
        }
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_backend_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_backend_error)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_backend_error)?;
        attach_channel_handlers(&dc, self.events.clone());
        Ok(Arc::new(WebRtcDataChannel { inner: dc }))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<usize, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotReady);
        }
        let buffered = self.inner.buffered_amount().await;
        if buffered + data.len() > MAX_BUFFERED_AMOUNT {
            return Err(ChannelError::SendFailure(format!(
                "{buffered} bytes already buffered"
            )));
        }
        self.inner
            .send(&data)
            .await
            .map_err(|err| ChannelError::SendFailure(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(target = "webrtc", error = %err, "data channel close failed");
        }
    }
}

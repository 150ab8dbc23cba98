//! Production engine backed by webrtc-rs

use super::engine::{
    ConnectionEvent, ConnectionEventSink, IceCandidate, RemoteTrackInfo, RtcConnection,
    RtcEngine, RtcSender, SdpType, SessionDescription, SignalingState, TransportState,
};
use crate::config::{ConnectionSettings, IceTransportPolicy};
use crate::media::{LocalTrack, MediaKind};
use crate::types::ClientId;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Engine creating real peer connections (Opus + VP8 and default
/// interceptors)
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self { api })
    }

    fn rtc_configuration(settings: &ConnectionSettings) -> RTCConfiguration {
        let ice_servers = settings
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
            })
            .collect();
        let ice_transport_policy = match settings.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        };
        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    #[instrument(skip(self, settings, events), fields(peer_id = %remote))]
    async fn create_connection(
        &self,
        remote: &ClientId,
        settings: &ConnectionSettings,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn RtcConnection>> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(Self::rtc_configuration(settings))
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(ConnectionEvent::LocalCandidate(candidate_from_init(init)));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    },
                    None => {
                        sink.emit(ConnectionEvent::GatheringComplete);
                    }
                }
            })
        }));

        let sink = events.clone();
        let peer_id = remote.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!(peer_id = %peer_id, "Peer connection state: {}", s);
                    if let Some(state) = transport_state(s) {
                        sink.emit(ConnectionEvent::TransportStateChanged(state));
                    }
                })
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(ConnectionEvent::RemoteTrack(RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind: media_kind(track.kind()),
                    }));
                })
            },
        ));

        info!("Created WebRTC peer connection");
        Ok(Arc::new(WebRtcConnection { peer_connection }))
    }
}

/// webrtc-rs peer connection
pub struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        parsed.map_err(|e| Error::Negotiation(format!("Failed to parse SDP: {}", e)))
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<Arc<dyn RtcSender>> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self
            .peer_connection
            .add_track(rtp)
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to add track: {}", e)))?;

        // RTCP must be drained for interceptors (NACK, reports) to work.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
            trace!("RTCP reader finished");
        });

        Ok(Arc::new(WebRtcSender {
            sender,
            kind: track.kind(),
            current: Mutex::new(track.id().to_string()),
        }))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

/// RTP sender of one attached local track
pub struct WebRtcSender {
    sender: Arc<RTCRtpSender>,
    kind: MediaKind,
    current: Mutex<String>,
}

#[async_trait]
impl RtcSender for WebRtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        if track.kind() != self.kind {
            return Err(Error::MediaTrack(format!(
                "cannot replace {} track with {} track",
                self.kind,
                track.kind()
            )));
        }
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        self.sender
            .replace_track(Some(rtp))
            .await
            .map_err(|e| Error::MediaTrack(format!("Failed to replace track: {}", e)))?;
        *self.current.lock() = track.id().to_string();
        Ok(())
    }

    fn current_track_id(&self) -> Option<String> {
        Some(self.current.lock().clone())
    }
}

//! webrtc-rs backed media engine
//!
//! Creates RTCPeerConnection instances, registers the codec table and maps
//! peer connection callbacks onto [`EngineEvent`]s.

use super::engine::{
    CodecCapability, ConnectionState, Direction, EngineEvent, EventSender, MediaEngine, MediaKind, MediaTrack,
    PeerConnection, TransceiverId,
};
use super::media_track::{RemoteTrack, SampleTrack};
use super::WhxpError;
use crate::config::IceServerConfig;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine as RtcMediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU, MIME_TYPE_VP8,
    MIME_TYPE_VP9,
};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// One registered codec
struct CodecEntry {
    kind: MediaKind,
    mime_type: &'static str,
    clock_rate: u32,
    channels: u16,
    sdp_fmtp_line: &'static str,
    payload_type: u8,
}

/// Codecs registered on every peer connection, in preference order
const CODECS: &[CodecEntry] = &[
    CodecEntry {
        kind: MediaKind::Audio,
        mime_type: MIME_TYPE_OPUS,
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1",
        payload_type: 111,
    },
    CodecEntry {
        kind: MediaKind::Audio,
        mime_type: MIME_TYPE_PCMU,
        clock_rate: 8000,
        channels: 0,
        sdp_fmtp_line: "",
        payload_type: 0,
    },
    CodecEntry {
        kind: MediaKind::Audio,
        mime_type: MIME_TYPE_PCMA,
        clock_rate: 8000,
        channels: 0,
        sdp_fmtp_line: "",
        payload_type: 8,
    },
    CodecEntry {
        kind: MediaKind::Video,
        mime_type: MIME_TYPE_H264,
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        payload_type: 96,
    },
    CodecEntry {
        kind: MediaKind::Video,
        mime_type: MIME_TYPE_VP8,
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "",
        payload_type: 97,
    },
    CodecEntry {
        kind: MediaKind::Video,
        mime_type: MIME_TYPE_VP9,
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "profile-id=0",
        payload_type: 98,
    },
];

impl CodecEntry {
    fn capability(&self) -> CodecCapability {
        CodecCapability::new(self.mime_type, self.clock_rate, self.channels, self.sdp_fmtp_line)
    }

    fn parameters(&self) -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: rtc_capability(&self.capability()),
            payload_type: self.payload_type,
            ..Default::default()
        }
    }

    fn matches(&self, codec: &CodecCapability) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && self.sdp_fmtp_line == codec.sdp_fmtp_line
    }
}

pub(crate) fn rtc_capability(codec: &CodecCapability) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
        rtcp_feedback: vec![],
    }
}

/// Codecs the engine negotiates for `kind`, in registration order
pub fn codec_capabilities(kind: MediaKind) -> Vec<CodecCapability> {
    CODECS.iter().filter(|c| c.kind == kind).map(CodecEntry::capability).collect()
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

pub(crate) fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

impl From<Direction> for RTCRtpTransceiverDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            Direction::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Peer connection factory using webrtc-rs
pub struct RtcEngine {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcEngine {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn build_api(&self) -> Result<API, WhxpError> {
        let mut media_engine = RtcMediaEngine::default();
        for codec in CODECS {
            media_engine
                .register_codec(codec.parameters(), codec_type(codec.kind))
                .map_err(|e| WhxpError::Engine(format!("Failed to register {}: {}", codec.mime_type, e)))?;
        }

        // Interceptors for RTCP feedback
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| WhxpError::Engine(format!("Failed to register interceptors: {}", e)))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_peer_connection(&self, events: EventSender) -> Result<Arc<dyn PeerConnection>, WhxpError> {
        let api = self.build_api()?;

        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WhxpError::Engine(format!("Failed to create peer connection: {}", e)))?;

        let peer = RtcPeer::new(Arc::new(pc), events);
        peer.install_callbacks();
        Ok(Arc::new(peer))
    }
}

/// [`PeerConnection`] over an `RTCPeerConnection`
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    transceivers: Mutex<Vec<Arc<RTCRtpTransceiver>>>,
    events: EventSender,
    connected: Arc<watch::Sender<bool>>,
}

impl RtcPeer {
    fn new(pc: Arc<RTCPeerConnection>, events: EventSender) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            pc,
            transceivers: Mutex::new(Vec::new()),
            events,
            connected: Arc::new(connected),
        }
    }

    fn install_callbacks(&self) {
        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let _ = events.send(EngineEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let connected = self.connected.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state: {}", state);
            let state = ConnectionState::from(state);
            connected.send_replace(state == ConnectionState::Connected);
            let _ = events.send(EngineEvent::ConnectionStateChanged(state));
            Box::pin(async {})
        }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                info!("Remote {} track {} arrived", track.kind(), track.id());
                let track: Arc<dyn MediaTrack> = RemoteTrack::spawn(track);
                let _ = events.send(EngineEvent::Track(track));
                Box::pin(async {})
            },
        ));
    }

    fn push_transceiver(&self, transceiver: Arc<RTCRtpTransceiver>) -> TransceiverId {
        let mut transceivers = self.transceivers.lock();
        transceivers.push(transceiver);
        TransceiverId(transceivers.len() - 1)
    }

    fn transceiver(&self, id: TransceiverId) -> Result<Arc<RTCRtpTransceiver>, WhxpError> {
        self.transceivers
            .lock()
            .get(id.0)
            .cloned()
            .ok_or_else(|| WhxpError::Engine(format!("Unknown transceiver {}", id.0)))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<String, WhxpError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| WhxpError::Sdp(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String, WhxpError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| WhxpError::Sdp(format!("Invalid SDP offer: {}", e)))?;

        // Candidates are not trickled, so wait for gathering to finish.
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| WhxpError::Sdp(format!("Failed to set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        match self.pc.local_description().await {
            Some(local_desc) => Ok(local_desc.sdp),
            None => Err(WhxpError::Sdp("Local description missing after gathering".to_string())),
        }
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), WhxpError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WhxpError::Sdp(format!("Invalid SDP answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| WhxpError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<TransceiverId, WhxpError> {
        let transceiver = self
            .pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: direction.into(),
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(|e| WhxpError::Engine(format!("Failed to add {} transceiver: {}", kind, e)))?;
        Ok(self.push_transceiver(transceiver))
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>, direction: Direction) -> Result<TransceiverId, WhxpError> {
        let sample = track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .ok_or_else(|| WhxpError::Engine(format!("Track {} was not captured by this engine", track.id())))?;

        let local = sample.local() as Arc<dyn TrackLocal + Send + Sync>;
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                local,
                Some(RTCRtpTransceiverInit {
                    direction: direction.into(),
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(|e| WhxpError::Engine(format!("Failed to add track {}: {}", track.id(), e)))?;

        // Drain RTCP so interceptors keep running
        let sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });

        sample.start(self.connected.subscribe());
        Ok(self.push_transceiver(transceiver))
    }

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability> {
        codec_capabilities(kind)
    }

    async fn set_codec_preferences(&self, transceiver: TransceiverId, codecs: &[CodecCapability]) -> Result<(), WhxpError> {
        let transceiver = self.transceiver(transceiver)?;
        let parameters = codecs
            .iter()
            .filter_map(|codec| CODECS.iter().find(|entry| entry.matches(codec)))
            .map(CodecEntry::parameters)
            .collect();
        transceiver
            .set_codec_preferences(parameters)
            .await
            .map_err(|e| WhxpError::Engine(format!("Failed to set codec preferences: {}", e)))
    }

    async fn close(&self) -> Result<(), WhxpError> {
        self.pc
            .close()
            .await
            .map_err(|e| WhxpError::Engine(format!("Failed to close connection: {}", e)))
    }
}

//! Native media engine boundary
//!
//! [`MediaEngine`] and [`MediaSession`] are the only call shapes the rest of
//! the system knows about; [`WebRtcEngine`] implements them over the `webrtc`
//! crate. The engine handle is constructed explicitly and owned by whoever
//! needs it, so multiple independent instances can coexist (tests included).

use crate::bridge::{
    DataChannelState, IceConnectionState, IceGatheringState, MediaKind, NotificationBridge,
    SignalingState,
};
use crate::sdp::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Errors surfaced by the engine boundary
///
/// The negotiation pipeline translates these into its own taxonomy; nothing
/// above the pipeline ever sees an engine-native error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine rejected or failed an operation
    #[error("engine operation failed: {0}")]
    Operation(String),

    /// The engine cannot express the requested media kind
    #[error("unsupported media kind: {0}")]
    Unsupported(String),
}

/// Media requested for one negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConstraints {
    /// Negotiate an audio section
    pub audio: bool,
    /// Negotiate a video section
    pub video: bool,
}

impl SessionConstraints {
    /// Audio-only constraints
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Audio-plus-video constraints
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Whether any media is enabled at all
    pub fn has_any(self) -> bool {
        self.audio || self.video
    }

    /// Kinds enabled by these constraints
    pub fn kinds(self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// One native peer connection, seen through the boundary
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Ask the engine for an offer; returns the raw SDP text
    async fn create_offer(&self, constraints: &SessionConstraints) -> Result<String, EngineError>;

    /// Ask the engine for an answer; returns the raw SDP text
    async fn create_answer(&self, constraints: &SessionConstraints) -> Result<String, EngineError>;

    /// Apply a validated description as local state
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    /// Apply a validated description as remote state
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    /// Hand a validated remote candidate to the engine
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    /// Add a transceiver for the given media kind
    async fn add_transceiver(&self, kind: MediaKind) -> Result<(), EngineError>;

    /// Release the native handle; no callbacks fire afterwards
    async fn close(&self) -> Result<(), EngineError>;
}

/// Factory for native peer connections
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a session whose callbacks feed the given bridge
    async fn create_session(
        &self,
        bridge: Arc<NotificationBridge>,
    ) -> Result<Arc<dyn MediaSession>, EngineError>;
}

/// Configuration for the `webrtc`-crate engine
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngineConfig {
    /// STUN/TURN server URLs handed to the engine
    pub ice_servers: Vec<String>,
}

/// [`MediaEngine`] implementation over the `webrtc` crate
///
/// Owns one API handle; construct one per process component that needs an
/// engine rather than sharing hidden global state.
pub struct WebRtcEngine {
    api: API,
    config: WebRtcEngineConfig,
}

impl WebRtcEngine {
    /// Build an engine with the given configuration
    pub fn new(config: WebRtcEngineConfig) -> Self {
        Self {
            api: APIBuilder::new().build(),
            config,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: if self.config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        }
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new(WebRtcEngineConfig::default())
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(
        &self,
        bridge: Arc<NotificationBridge>,
    ) -> Result<Arc<dyn MediaSession>, EngineError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| EngineError::Operation(format!("failed to create peer connection: {e}")))?;
        let pc = Arc::new(pc);
        attach_observer(&pc, &bridge);
        Ok(Arc::new(WebRtcSession { pc }))
    }
}

/// [`MediaSession`] over one `RTCPeerConnection`
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self, constraints: &SessionConstraints) -> Result<String, EngineError> {
        let options = RTCOfferOptions {
            voice_activity_detection: constraints.audio,
            ice_restart: false,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| EngineError::Operation(format!("create_offer: {e}")))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self, constraints: &SessionConstraints) -> Result<String, EngineError> {
        let options = RTCAnswerOptions {
            voice_activity_detection: constraints.audio,
        };
        let answer = self
            .pc
            .create_answer(Some(options))
            .await
            .map_err(|e| EngineError::Operation(format!("create_answer: {e}")))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let native = description
            .to_native()
            .map_err(|e| EngineError::Operation(e.to_string()))?;
        self.pc
            .set_local_description(native)
            .await
            .map_err(|e| EngineError::Operation(format!("set_local_description: {e}")))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let native = description
            .to_native()
            .map_err(|e| EngineError::Operation(e.to_string()))?;
        self.pc
            .set_remote_description(native)
            .await
            .map_err(|e| EngineError::Operation(format!("set_remote_description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(candidate.to_native())
            .await
            .map_err(|e| EngineError::Operation(format!("add_ice_candidate: {e}")))
    }

    async fn add_transceiver(&self, kind: MediaKind) -> Result<(), EngineError> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(codec_type, None)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unsupported(format!("{kind}: {e}")))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|e| EngineError::Operation(format!("close: {e}")))
    }
}

/// Wire every engine callback into the bridge
///
/// The engine invokes these from its own threads; the bridge's lock and
/// shutdown flag make that safe.
fn attach_observer(pc: &Arc<RTCPeerConnection>, bridge: &Arc<NotificationBridge>) {
    let b = Arc::clone(bridge);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let b = Arc::clone(&b);
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => match IceCandidate::from_native(&init, b.next_candidate_id()) {
                    Ok(candidate) => b.candidate_generated(candidate),
                    Err(e) => tracing::warn!(error = %e, "discarding malformed local candidate"),
                },
                Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
            }
        })
    }));

    let b = Arc::clone(bridge);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        b.ice_connection_changed(normalize_ice_connection_state(state));
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        b.ice_connection_standardized_changed(normalize_peer_connection_state(state));
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        b.ice_gathering_changed(normalize_gathering_state(state));
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        b.signaling_changed(normalize_signaling_state(state));
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_negotiation_needed(Box::new(move || {
        b.should_negotiate();
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        };
        let stream_id = track.stream_id();
        let track_id = track.id();
        if let Some(kind) = kind {
            b.receiver_added(kind, vec![stream_id.clone()], track_id);
            b.stream_added(stream_id);
        } else {
            tracing::warn!(track_id = %track_id, "ignoring track of unknown kind");
        }
        Box::pin(async {})
    }));

    let b = Arc::clone(bridge);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let b = Arc::clone(&b);
        Box::pin(async move {
            let label = dc.label().to_string();
            b.data_channel_opened(label.clone());

            let b_open = Arc::clone(&b);
            let label_open = label.clone();
            dc.on_open(Box::new(move || {
                b_open.data_channel_state_changed(label_open.clone(), DataChannelState::Open);
                Box::pin(async {})
            }));

            let b_msg = Arc::clone(&b);
            let label_msg = label.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                b_msg.data_channel_message(label_msg.clone(), msg.data.clone());
                Box::pin(async {})
            }));

            let b_close = Arc::clone(&b);
            dc.on_close(Box::new(move || {
                b_close.data_channel_state_changed(label.clone(), DataChannelState::Closed);
                Box::pin(async {})
            }));
        })
    }));
}

fn normalize_ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn normalize_peer_connection_state(state: RTCPeerConnectionState) -> IceConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => IceConnectionState::Checking,
        RTCPeerConnectionState::Connected => IceConnectionState::Connected,
        RTCPeerConnectionState::Failed => IceConnectionState::Failed,
        RTCPeerConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCPeerConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn normalize_gathering_state(state: RTCIceGathererState) -> IceGatheringState {
    match state {
        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
        RTCIceGathererState::Complete => IceGatheringState::Complete,
        _ => IceGatheringState::New,
    }
}

fn normalize_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPrAnswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePrAnswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

//! Validated SDP and ICE candidate models
//!
//! Raw negotiation payloads from the remote peer or the native engine are
//! only ever handled through these types. Conversion to the engine's own
//! representation happens at the engine boundary and nowhere else.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Validation errors for negotiation payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    /// The SDP text failed structural validation
    #[error("invalid SDP format: {0}")]
    InvalidFormat(String),

    /// An ICE candidate field failed validation
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Role of a session description in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initial proposal
    Offer,
    /// Final response to an offer
    Answer,
    /// Provisional response to an offer
    #[serde(rename = "pranswer")]
    PrAnswer,
    /// Cancel the pending local offer
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::PrAnswer => "pranswer",
            Self::Rollback => "rollback",
        };
        write!(f, "{s}")
    }
}

impl From<SdpType> for RTCSdpType {
    fn from(kind: SdpType) -> Self {
        match kind {
            SdpType::Offer => RTCSdpType::Offer,
            SdpType::Answer => RTCSdpType::Answer,
            SdpType::PrAnswer => RTCSdpType::Pranswer,
            SdpType::Rollback => RTCSdpType::Rollback,
        }
    }
}

impl TryFrom<RTCSdpType> for SdpType {
    type Error = SdpError;

    fn try_from(kind: RTCSdpType) -> Result<Self, Self::Error> {
        match kind {
            RTCSdpType::Offer => Ok(Self::Offer),
            RTCSdpType::Answer => Ok(Self::Answer),
            RTCSdpType::Pranswer => Ok(Self::PrAnswer),
            RTCSdpType::Rollback => Ok(Self::Rollback),
            other => Err(SdpError::InvalidFormat(format!(
                "unrecognized description type {other:?}"
            ))),
        }
    }
}

/// Structural check shared by every [`SessionDescription`] factory
///
/// Accepts exactly the payloads that are non-blank, start with `v=0` and
/// carry `o=`, `s=` and `t=` sections. Everything else is rejected before it
/// can reach the native engine.
fn validate_sdp_text(sdp: &str) -> Result<(), SdpError> {
    if sdp.trim().is_empty() {
        return Err(SdpError::InvalidFormat("SDP must not be blank".to_string()));
    }
    if !sdp.starts_with("v=0") {
        return Err(SdpError::InvalidFormat(
            "SDP must start with a v=0 version line".to_string(),
        ));
    }
    for section in ["o=", "s=", "t="] {
        if !sdp.contains(section) {
            return Err(SdpError::InvalidFormat(format!(
                "SDP is missing its {section} section"
            )));
        }
    }
    Ok(())
}

/// A validated SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    kind: SdpType,
    sdp: String,
}

impl SessionDescription {
    /// Create a description of the given kind from raw SDP text
    ///
    /// # Errors
    ///
    /// Returns [`SdpError::InvalidFormat`] when the text fails the structural
    /// check.
    pub fn new(kind: SdpType, sdp: impl Into<String>) -> Result<Self, SdpError> {
        let sdp = sdp.into();
        validate_sdp_text(&sdp)?;
        Ok(Self { kind, sdp })
    }

    /// Validated offer
    pub fn offer(sdp: impl Into<String>) -> Result<Self, SdpError> {
        Self::new(SdpType::Offer, sdp)
    }

    /// Validated answer
    pub fn answer(sdp: impl Into<String>) -> Result<Self, SdpError> {
        Self::new(SdpType::Answer, sdp)
    }

    /// Role of this description in the exchange
    pub fn kind(&self) -> SdpType {
        self.kind
    }

    /// Raw SDP text
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Convert to the engine's native representation
    ///
    /// # Errors
    ///
    /// Returns [`SdpError::InvalidFormat`] if the engine rejects the payload
    /// or the kind cannot carry SDP text (rollback).
    pub fn to_native(&self) -> Result<RTCSessionDescription, SdpError> {
        let native = match self.kind {
            SdpType::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SdpType::PrAnswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SdpType::Rollback => {
                return Err(SdpError::InvalidFormat(
                    "rollback descriptions carry no SDP payload".to_string(),
                ))
            }
        };
        native.map_err(|e| SdpError::InvalidFormat(e.to_string()))
    }

    /// Validate and wrap a description produced by the engine
    ///
    /// # Errors
    ///
    /// Returns [`SdpError`] when the engine handed back something that fails
    /// the same structural check applied to remote payloads.
    pub fn from_native(native: &RTCSessionDescription) -> Result<Self, SdpError> {
        let kind = SdpType::try_from(native.sdp_type)?;
        Self::new(kind, native.sdp.clone())
    }
}

/// Network path classification parsed out of a candidate line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Address discovered via STUN
    ServerReflexive,
    /// Address learned from connectivity checks
    PeerReflexive,
    /// Relayed through a TURN server
    Relay,
}

impl CandidateType {
    /// Wire token used in the candidate line
    pub fn token(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

/// A validated ICE candidate
///
/// Constructed from remote signaling payloads or engine callbacks, immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    id: i64,
    sdp: String,
    sdp_mline_index: u16,
    sdp_mid: Option<String>,
}

impl IceCandidate {
    /// Create a candidate, rejecting blank SDP and negative indices
    ///
    /// # Errors
    ///
    /// Returns [`SdpError::InvalidCandidate`] for a blank candidate line, a
    /// negative id, or a negative or out-of-range m-line index.
    pub fn new(
        id: i64,
        sdp: impl Into<String>,
        sdp_mline_index: i32,
        sdp_mid: Option<String>,
    ) -> Result<Self, SdpError> {
        if id < 0 {
            return Err(SdpError::InvalidCandidate(format!(
                "candidate id must not be negative, got {id}"
            )));
        }
        let sdp = sdp.into().trim().to_string();
        if sdp.is_empty() {
            return Err(SdpError::InvalidCandidate(
                "candidate SDP must not be blank".to_string(),
            ));
        }
        let sdp_mline_index = u16::try_from(sdp_mline_index).map_err(|_| {
            SdpError::InvalidCandidate(format!(
                "m-line index must be in 0..={}, got {sdp_mline_index}",
                u16::MAX
            ))
        })?;
        let sdp_mid = sdp_mid
            .map(|mid| mid.trim().to_string())
            .filter(|mid| !mid.is_empty());

        Ok(Self {
            id,
            sdp,
            sdp_mline_index,
            sdp_mid,
        })
    }

    /// Candidate identifier, unique within one connection
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Trimmed candidate line
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Media line the candidate belongs to
    pub fn sdp_mline_index(&self) -> u16 {
        self.sdp_mline_index
    }

    /// Media stream identification tag, if present
    pub fn sdp_mid(&self) -> Option<&str> {
        self.sdp_mid.as_deref()
    }

    /// Classify the network path by inspecting the candidate line
    pub fn candidate_type(&self) -> Option<CandidateType> {
        [
            CandidateType::Host,
            CandidateType::ServerReflexive,
            CandidateType::PeerReflexive,
            CandidateType::Relay,
        ]
        .into_iter()
        .find(|t| self.sdp.contains(&format!("typ {}", t.token())))
    }

    /// Whether this candidate names a local interface address
    pub fn is_local(&self) -> bool {
        self.candidate_type() == Some(CandidateType::Host)
    }

    /// Convert to the engine's native representation
    pub fn to_native(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.sdp.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: Some(self.sdp_mline_index),
            username_fragment: None,
        }
    }

    /// Validate and wrap a candidate produced by the engine
    ///
    /// The engine does not number its candidates; the caller assigns `id`.
    ///
    /// # Errors
    ///
    /// Returns [`SdpError::InvalidCandidate`] when the native payload fails
    /// the construction invariants.
    pub fn from_native(native: &RTCIceCandidateInit, id: i64) -> Result<Self, SdpError> {
        Self::new(
            id,
            native.candidate.clone(),
            i32::from(native.sdp_mline_index.unwrap_or(0)),
            native.sdp_mid.clone(),
        )
    }
}

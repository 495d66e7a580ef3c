//! Transport delegate boundary
//!
//! This core never talks to the network. When local negotiation state
//! changes, it calls the application-supplied [`TransportDelegate`] and
//! expects the payload to reach the remote peer by whatever channel the
//! application chooses.

use crate::sdp::{IceCandidate, SessionDescription};
use crate::types::{Call, CallType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Mid-call media change requests carried over signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaDirective {
    /// Add video to a voice call
    UpgradeToVideo,
    /// Drop an audio+video call back to voice
    DowngradeToVoice,
}

impl MediaDirective {
    /// The call type this directive drives the call towards
    pub fn target_type(self) -> CallType {
        match self {
            Self::UpgradeToVideo => CallType::Video,
            Self::DowngradeToVoice => CallType::Voice,
        }
    }
}

/// Application-supplied signaling transport
///
/// Errors are opaque to this core: they are logged, may fail the call, but
/// are never interpreted. All methods are keyed by the call's shared
/// communication id so the application can route them.
#[async_trait]
pub trait TransportDelegate: Send + Sync {
    /// Deliver a local ICE candidate to the remote peer
    async fn send_candidate(
        &self,
        shared_communication_id: &str,
        candidate: &IceCandidate,
    ) -> anyhow::Result<()>;

    /// Deliver a local offer or answer to the remote peer
    async fn send_sdp(
        &self,
        shared_communication_id: &str,
        description: &SessionDescription,
    ) -> anyhow::Result<()>;

    /// Tell the remote peer the call is over
    async fn send_end_call(&self, shared_communication_id: &str) -> anyhow::Result<()>;

    /// Ask the remote peer to upgrade or downgrade media
    async fn send_upgrade_downgrade(
        &self,
        shared_communication_id: &str,
        directive: MediaDirective,
    ) -> anyhow::Result<()>;

    /// Propagate updated call metadata (for companion devices and history)
    async fn update_metadata(&self, call: &Call) -> anyhow::Result<()>;
}

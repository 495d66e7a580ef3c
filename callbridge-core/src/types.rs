//! Call metadata value model
//!
//! Everything here is validated at construction and immutable afterwards,
//! except for the single explicit [`Call::end`] lifecycle mutation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for call metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A participant field failed validation
    #[error("invalid participant: {0}")]
    InvalidParticipant(String),

    /// Call-level metadata failed validation
    #[error("invalid call metadata: {0}")]
    InvalidMetadata(String),
}

/// Unique identifier for one native-engine connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One party on a call
///
/// `secret_name` is the stable identity, `nickname` the display name, and
/// `device_id` distinguishes devices on the same account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    secret_name: String,
    nickname: String,
    device_id: String,
}

impl Participant {
    /// Create a participant, rejecting blank fields
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidParticipant`] if any field is empty after
    /// trimming whitespace.
    pub fn new(
        secret_name: impl Into<String>,
        nickname: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let secret_name = secret_name.into();
        let nickname = nickname.into();
        let device_id = device_id.into();

        for (field, value) in [
            ("secret_name", &secret_name),
            ("nickname", &nickname),
            ("device_id", &device_id),
        ] {
            if value.trim().is_empty() {
                return Err(ModelError::InvalidParticipant(format!(
                    "{field} must not be blank"
                )));
            }
        }

        Ok(Self {
            secret_name,
            nickname,
            device_id,
        })
    }

    /// Stable identity of this participant
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    /// Display name
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Device identifier
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nickname, self.device_id)
    }
}

/// Media composition of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio plus video
    Video,
}

impl CallType {
    /// Whether this call type carries video
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Which side initiated the call, tagged with its media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", content = "call_type", rename_all = "snake_case")]
pub enum CallDirection {
    /// The remote peer initiated the call
    Inbound(CallType),
    /// We initiated the call
    Outbound(CallType),
}

impl CallDirection {
    /// Media type carried by this direction
    pub fn call_type(self) -> CallType {
        match self {
            Self::Inbound(t) | Self::Outbound(t) => t,
        }
    }

    /// True when the remote peer initiated the call
    pub fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound(_))
    }

    /// Same direction retagged with a different media type
    ///
    /// Used when an active call upgrades to video or downgrades to voice.
    pub fn with_type(self, call_type: CallType) -> Self {
        match self {
            Self::Inbound(_) => Self::Inbound(call_type),
            Self::Outbound(_) => Self::Outbound(call_type),
        }
    }
}

/// How a call reached its end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndState {
    /// We hung up
    HungUp,
    /// The remote peer hung up
    RemoteHungUp,
    /// The callee declined
    Declined,
    /// The call was never answered
    Unanswered,
    /// The call ended because of a failure
    Failed,
}

/// One call instance
///
/// `shared_communication_id` correlates this call across devices and peers.
/// Once [`Call::end`] has stamped `ended_at` the call is terminal and no
/// further mutation is possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    shared_communication_id: String,
    sender: Participant,
    recipients: Vec<Participant>,
    supports_video: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_state: Option<CallEndState>,
    unanswered: bool,
}

impl Call {
    /// Create a call, validating its metadata
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidMetadata`] if the shared communication id
    /// is blank or the recipient list is empty. Participants are validated by
    /// their own constructor before they get here.
    pub fn new(
        shared_communication_id: impl Into<String>,
        sender: Participant,
        recipients: Vec<Participant>,
        supports_video: bool,
    ) -> Result<Self, ModelError> {
        let shared_communication_id = shared_communication_id.into();
        if shared_communication_id.trim().is_empty() {
            return Err(ModelError::InvalidMetadata(
                "shared communication id must not be blank".to_string(),
            ));
        }
        if recipients.is_empty() {
            return Err(ModelError::InvalidMetadata(
                "a call needs at least one recipient".to_string(),
            ));
        }

        Ok(Self {
            shared_communication_id,
            sender,
            recipients,
            supports_video,
            is_active: true,
            created_at: Utc::now(),
            ended_at: None,
            end_state: None,
            unanswered: false,
        })
    }

    /// Cross-device correlation key
    pub fn shared_communication_id(&self) -> &str {
        &self.shared_communication_id
    }

    /// The participant who initiated the call
    pub fn sender(&self) -> &Participant {
        &self.sender
    }

    /// Everyone the call was addressed to
    pub fn recipients(&self) -> &[Participant] {
        &self.recipients
    }

    /// All participants except the one with the given secret name
    pub fn other_participants(&self, local_secret_name: &str) -> Vec<&Participant> {
        std::iter::once(&self.sender)
            .chain(self.recipients.iter())
            .filter(|p| p.secret_name() != local_secret_name)
            .collect()
    }

    /// Whether video was negotiated for this call
    pub fn supports_video(&self) -> bool {
        self.supports_video
    }

    /// Whether the call is still live
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// When the call was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the call ended, if it has
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// How the call ended, if it has
    pub fn end_state(&self) -> Option<CallEndState> {
        self.end_state
    }

    /// Whether the call rang out without being answered
    pub fn unanswered(&self) -> bool {
        self.unanswered
    }

    /// Whether `end` has stamped this call
    pub fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Terminal calls accept no further mutation
    pub fn is_terminal(&self) -> bool {
        self.has_ended()
    }

    /// End the call, stamping `ended_at` and the end state
    ///
    /// A second call is a no-op: the first end state wins.
    pub fn end(&mut self, end_state: CallEndState) {
        if self.has_ended() {
            tracing::debug!(
                shared_communication_id = %self.shared_communication_id,
                "end requested on already-ended call, keeping original end state"
            );
            return;
        }
        self.ended_at = Some(Utc::now());
        self.end_state = Some(end_state);
        self.unanswered = end_state == CallEndState::Unanswered;
        self.is_active = false;
    }

    /// Time between creation and end, or `None` while the call is live
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|ended| ended - self.created_at)
    }
}

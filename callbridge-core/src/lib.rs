//! Callbridge - client-side call-session orchestration
//!
//! This library sits between an application UI and a native real-time-media
//! engine (the WebRTC stack). It owns the authoritative lifecycle of a
//! voice/video call and serializes every negotiation side effect:
//!
//! - **Call state machine**: one race-free state timeline reconciling local
//!   user actions, remote signaling and native engine callbacks
//! - **Connection registry**: single-writer map of live negotiations
//! - **SDP/ICE pipeline**: validation on both sides of the engine boundary
//! - **Notification bridge**: engine callbacks normalized into ordered,
//!   per-connection event streams
//!
//! Media transport, rendering and the signaling wire protocol live outside:
//! the application supplies a [`TransportDelegate`] and the engine is reached
//! through the [`MediaEngine`] boundary.
//!
//! # Examples
//!
//! ```rust
//! use callbridge_core::{Call, CallDirection, CallState, CallStateMachine, CallType, Participant};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let alice = Participant::new("alice", "Alice", "phone-1")?;
//! let bob = Participant::new("bob", "Bob", "laptop-2")?;
//! let call = Call::new("shared-id-1", alice, vec![bob], true)?;
//!
//! let machine = CallStateMachine::new();
//! let mut states = machine.subscribe().await;
//!
//! machine.transition(CallState::Ready { call: call.clone() }).await;
//! machine
//!     .transition(CallState::Connecting {
//!         direction: CallDirection::Outbound(CallType::Video),
//!         call,
//!     })
//!     .await;
//!
//! while let Some(state) = states.next().await {
//!     println!("call is now {}", state.name());
//!     if matches!(state, CallState::Connecting { .. }) {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call metadata value model
pub mod types;

/// Validated SDP and ICE candidate models
pub mod sdp;

/// Authoritative call lifecycle state
pub mod state_machine;

/// Native callback to event stream adapter
pub mod bridge;

/// Authoritative connection record collection
pub mod registry;

/// Native media engine boundary
pub mod engine;

/// SDP/ICE negotiation pipeline
pub mod negotiation;

/// Application-supplied signaling boundary
pub mod transport;

/// Call session orchestration
pub mod service;

// Re-export main types at crate root
pub use bridge::{
    ConnectionEvent, DataChannelState, EventSubscription, IceConnectionState, IceGatheringState,
    MediaKind, NotificationBridge, SignalingState,
};
pub use engine::{
    EngineError, MediaEngine, MediaSession, SessionConstraints, WebRtcEngine, WebRtcEngineConfig,
};
pub use negotiation::{NegotiationError, NegotiationPipeline};
pub use registry::{ConnectionRecord, ConnectionRegistry, TrackRef};
pub use sdp::{CandidateType, IceCandidate, SdpError, SdpType, SessionDescription};
pub use service::{CallService, CallServiceBuilder, CallServiceConfig, ServiceError};
pub use state_machine::{CallState, CallStateMachine, StateSubscription};
pub use transport::{MediaDirective, TransportDelegate};
pub use types::{
    Call, CallDirection, CallEndState, CallType, ConnectionId, ModelError, Participant,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{ConnectionEvent, MediaKind, NotificationBridge};
    pub use crate::engine::{MediaEngine, MediaSession, WebRtcEngine, WebRtcEngineConfig};
    pub use crate::negotiation::{NegotiationError, NegotiationPipeline};
    pub use crate::registry::{ConnectionRecord, ConnectionRegistry};
    pub use crate::sdp::{IceCandidate, SdpType, SessionDescription};
    pub use crate::service::{CallService, CallServiceConfig, ServiceError};
    pub use crate::state_machine::{CallState, CallStateMachine};
    pub use crate::transport::{MediaDirective, TransportDelegate};
    pub use crate::types::{
        Call, CallDirection, CallEndState, CallType, ConnectionId, Participant,
    };
}

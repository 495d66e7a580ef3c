//! Authoritative call lifecycle state
//!
//! One [`CallStateMachine`] owns the current [`CallState`] for a call and
//! serializes every transition. Duplicate and impossible transitions are
//! absorbed as no-ops by design, never surfaced as errors: three independent
//! event sources (local user actions, remote signaling, engine callbacks) may
//! legitimately observe the same fact and request the same transition.

use crate::types::{Call, CallDirection, CallEndState, CallType};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::WatchStream;

/// Closed set of call lifecycle states
///
/// `Ended`, `Failed` and `AnsweredElsewhere` are terminal: nothing but an
/// explicit [`CallStateMachine::reset`] leaves them. `ReceivedVideoUpgrade`
/// and `ReceivedVoiceDowngrade` are momentary signal states that carry no
/// call data and may recur during one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// No call yet
    Waiting,
    /// Call metadata validated, negotiation not started
    Ready {
        /// The call being set up
        call: Call,
    },
    /// Negotiation in progress
    Connecting {
        /// Who initiated, with media type
        direction: CallDirection,
        /// The call being connected
        call: Call,
    },
    /// Media is flowing
    Connected {
        /// Who initiated, with media type
        direction: CallDirection,
        /// The live call
        call: Call,
    },
    /// Call parked on hold
    Held {
        /// Direction, when it was known at hold time
        direction: Option<CallDirection>,
        /// The held call
        call: Call,
    },
    /// Remote peer asked to add video
    ReceivedVideoUpgrade,
    /// Remote peer asked to drop back to voice
    ReceivedVoiceDowngrade,
    /// Another device on this account answered first (terminal)
    AnsweredElsewhere {
        /// The call picked up elsewhere
        call: Call,
    },
    /// Call completed (terminal)
    Ended {
        /// How it ended
        end_state: CallEndState,
        /// The finished call
        call: Call,
    },
    /// Call aborted by an error (terminal)
    Failed {
        /// Direction, when it was known at failure time
        direction: Option<CallDirection>,
        /// The failed call
        call: Call,
        /// Human-readable failure description
        reason: String,
    },
}

impl CallState {
    /// Whether no transition can leave this state without a reset
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended { .. } | Self::Failed { .. } | Self::AnsweredElsewhere { .. }
        )
    }

    /// The call carried by this state, if any
    pub fn call(&self) -> Option<&Call> {
        match self {
            Self::Ready { call }
            | Self::Connecting { call, .. }
            | Self::Connected { call, .. }
            | Self::Held { call, .. }
            | Self::AnsweredElsewhere { call }
            | Self::Ended { call, .. }
            | Self::Failed { call, .. } => Some(call),
            Self::Waiting | Self::ReceivedVideoUpgrade | Self::ReceivedVoiceDowngrade => None,
        }
    }

    /// The direction carried by this state, if any
    pub fn direction(&self) -> Option<CallDirection> {
        match self {
            Self::Connecting { direction, .. } | Self::Connected { direction, .. } => {
                Some(*direction)
            }
            Self::Held { direction, .. } | Self::Failed { direction, .. } => *direction,
            _ => None,
        }
    }

    /// Stable name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready { .. } => "ready",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Held { .. } => "held",
            Self::ReceivedVideoUpgrade => "received_video_upgrade",
            Self::ReceivedVoiceDowngrade => "received_voice_downgrade",
            Self::AnsweredElsewhere { .. } => "answered_elsewhere",
            Self::Ended { .. } => "ended",
            Self::Failed { .. } => "failed",
        }
    }
}

struct Inner {
    current: CallState,
    direction: Option<CallDirection>,
    call_type: Option<CallType>,
    tx: watch::Sender<CallState>,
}

/// Serialized owner of the call's [`CallState`]
///
/// All mutation goes through [`transition`](Self::transition) and
/// [`reset`](Self::reset); observers pull distinct states through
/// [`subscribe`](Self::subscribe).
pub struct CallStateMachine {
    inner: Mutex<Inner>,
}

impl CallStateMachine {
    /// Create a machine in the `Waiting` state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CallState::Waiting);
        Self {
            inner: Mutex::new(Inner {
                current: CallState::Waiting,
                direction: None,
                call_type: None,
                tx,
            }),
        }
    }

    /// Request a transition to `next`
    ///
    /// Returns `true` when the state changed and was broadcast. A request
    /// structurally equal to the current state, or any request while the
    /// current state is terminal, is absorbed: logged, not broadcast, and
    /// `false` is returned. Absorption is policy, not an error.
    pub async fn transition(&self, next: CallState) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.current == next {
            tracing::trace!(state = next.name(), "duplicate transition absorbed");
            return false;
        }
        if inner.current.is_terminal() {
            tracing::debug!(
                current = inner.current.name(),
                requested = next.name(),
                "transition out of terminal state absorbed"
            );
            return false;
        }

        match &next {
            CallState::Connecting { direction, .. } | CallState::Connected { direction, .. } => {
                inner.direction = Some(*direction);
                inner.call_type = Some(direction.call_type());
            }
            CallState::Held { direction, .. } | CallState::Failed { direction, .. } => {
                if let Some(direction) = direction {
                    inner.direction = Some(*direction);
                    inner.call_type = Some(direction.call_type());
                }
            }
            CallState::ReceivedVideoUpgrade => {
                inner.call_type = Some(CallType::Video);
                inner.direction = inner.direction.map(|d| d.with_type(CallType::Video));
            }
            CallState::ReceivedVoiceDowngrade => {
                inner.call_type = Some(CallType::Voice);
                inner.direction = inner.direction.map(|d| d.with_type(CallType::Voice));
            }
            CallState::Waiting
            | CallState::Ready { .. }
            | CallState::AnsweredElsewhere { .. }
            | CallState::Ended { .. } => {}
        }

        tracing::debug!(
            from = inner.current.name(),
            to = next.name(),
            "call state transition"
        );
        inner.current = next.clone();
        inner.tx.send_replace(next);
        true
    }

    /// Snapshot of the current state
    pub async fn current(&self) -> CallState {
        self.inner.lock().await.current.clone()
    }

    /// Direction recorded by the most recent transition that carried one
    pub async fn direction(&self) -> Option<CallDirection> {
        self.inner.lock().await.direction
    }

    /// Media type recorded by the most recent transition that carried one
    pub async fn call_type(&self) -> Option<CallType> {
        self.inner.lock().await.call_type
    }

    /// Number of live subscriptions
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.tx.receiver_count()
    }

    /// Open a new state subscription
    ///
    /// The subscription yields every distinct transition from this moment
    /// onward, latest-value-only: a slow consumer sees the newest state, not
    /// a backlog. It ends (yields `None`) when the machine is reset.
    pub async fn subscribe(&self) -> StateSubscription {
        StateSubscription {
            rx: self.inner.lock().await.tx.subscribe(),
        }
    }

    /// Clear call, direction and type, return to `Waiting`, and finish every
    /// live subscription
    ///
    /// This is the only way out of a terminal state; it starts a fresh call
    /// lifecycle with a fresh broadcast channel so no state leaks between
    /// calls.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.current = CallState::Waiting;
        inner.direction = None;
        inner.call_type = None;
        let (tx, _rx) = watch::channel(CallState::Waiting);
        // Dropping the old sender is the end-of-sequence signal.
        inner.tx = tx;
        tracing::debug!("call state machine reset");
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of the state sequence
pub struct StateSubscription {
    rx: watch::Receiver<CallState>,
}

impl StateSubscription {
    /// Wait for the next distinct state
    ///
    /// Returns `None` once the machine has been reset. States broadcast
    /// before the reset but not yet consumed are still delivered first.
    pub async fn next(&mut self) -> Option<CallState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Adapt into a [`futures::Stream`] of states
    pub fn into_stream(self) -> WatchStream<CallState> {
        WatchStream::from_changes(self.rx)
    }
}

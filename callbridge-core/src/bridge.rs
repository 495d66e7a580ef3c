//! Notification bridge
//!
//! Adapts native-engine callbacks, which arrive on arbitrary threads in
//! engine-defined order, into one ordered per-connection event stream with a
//! fixed vocabulary. Every handler funnels through a single exclusion lock;
//! events arriving before a connection id is assigned, or after the bridge is
//! finished, are dropped.

use crate::sdp::IceCandidate;
use crate::types::ConnectionId;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::broadcast;

/// Default capacity of the outbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Kind of media carried by a track or transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(format!("unsupported media kind: {other}")),
        }
    }
}

/// Normalized ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceConnectionState {
    /// Gathering has not produced checks yet
    New,
    /// Connectivity checks in flight
    Checking,
    /// A usable pair was found
    Connected,
    /// All checks finished successfully
    Completed,
    /// No usable pair could be found
    Failed,
    /// A previously usable pair stopped working
    Disconnected,
    /// The transport was shut down
    Closed,
}

/// Normalized ICE gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceGatheringState {
    /// Gathering not started
    New,
    /// Candidates being discovered
    Gathering,
    /// All candidates discovered
    Complete,
}

/// Normalized signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer pending
    HaveRemoteOffer,
    /// Provisional local answer applied
    HaveLocalPrAnswer,
    /// Provisional remote answer applied
    HaveRemotePrAnswer,
    /// Negotiation shut down
    Closed,
}

/// Normalized data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChannelState {
    /// Channel being established
    Connecting,
    /// Channel usable
    Open,
    /// Channel shutting down
    Closing,
    /// Channel closed
    Closed,
}

/// Fixed vocabulary of per-connection events
///
/// Everything the native engine can tell us is expressed as one of these,
/// scoped by the connection id the bridge was assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// ICE gathering state changed
    IceGatheringChanged {
        /// New gathering state
        state: IceGatheringState,
    },
    /// Signaling state changed
    SignalingChanged {
        /// New signaling state
        state: SignalingState,
    },
    /// A remote media stream was attached
    StreamAdded {
        /// Stream identifier
        stream_id: String,
    },
    /// A remote media stream was detached
    StreamRemoved {
        /// Stream identifier
        stream_id: String,
    },
    /// ICE connection state changed
    IceConnectionChanged {
        /// New connection state
        state: IceConnectionState,
    },
    /// Standardized ICE connection state changed
    ///
    /// Engines report connectivity twice, once through the legacy ICE state
    /// and once through the standardized aggregate; both are forwarded so
    /// consumers can pick one.
    IceConnectionStandardizedChanged {
        /// New connection state
        state: IceConnectionState,
    },
    /// The engine discovered a local ICE candidate
    IceCandidateGenerated {
        /// The validated candidate
        candidate: IceCandidate,
    },
    /// The engine withdrew previously generated candidates
    IceCandidatesRemoved {
        /// Number of withdrawn candidates
        count: usize,
    },
    /// A remote receiver/track pair was added
    ReceiverAdded {
        /// Media kind of the track
        kind: MediaKind,
        /// Streams the track belongs to
        stream_ids: Vec<String>,
        /// Track identifier
        track_id: String,
    },
    /// The remote peer opened a data channel
    DataChannelOpened {
        /// Channel label
        label: String,
    },
    /// A message arrived on a data channel
    DataChannelMessage {
        /// Channel label
        label: String,
        /// Message payload
        payload: Bytes,
    },
    /// A data channel changed state
    DataChannelStateChanged {
        /// Channel label
        label: String,
        /// New channel state
        state: DataChannelState,
    },
    /// The engine wants a new offer/answer round
    ShouldNegotiate,
}

/// Per-connection adapter from native callbacks to an ordered event stream
///
/// Handlers are plain synchronous functions so the engine can call them from
/// any thread; the per-bridge lock is the single funnel that turns that
/// uncontrolled concurrency into an ordered sequence.
pub struct NotificationBridge {
    connection_id: OnceCell<ConnectionId>,
    shutdown: AtomicBool,
    next_candidate_id: AtomicI64,
    events: Mutex<Option<broadcast::Sender<ConnectionEvent>>>,
}

impl NotificationBridge {
    /// Create a bridge with no connection id assigned yet
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connection_id: OnceCell::new(),
            shutdown: AtomicBool::new(false),
            next_candidate_id: AtomicI64::new(0),
            events: Mutex::new(Some(tx)),
        }
    }

    /// Assign the connection id this bridge publishes under
    ///
    /// Until this is called every event is dropped. Assignment is
    /// write-once; a second id is rejected with a warning.
    pub fn assign_connection_id(&self, id: ConnectionId) {
        if self.connection_id.set(id).is_err() {
            tracing::warn!(
                connection_id = %id,
                "bridge already has a connection id, ignoring reassignment"
            );
        }
    }

    /// The assigned connection id, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id.get().copied()
    }

    /// Allocate the next local candidate id for this connection
    pub fn next_candidate_id(&self) -> i64 {
        self.next_candidate_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a subscription to this bridge's event stream
    ///
    /// The subscription yields events in publish order and skips ahead when
    /// the consumer falls behind; it ends after [`finish`](Self::finish).
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.events.lock().as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Stop delivery permanently
    ///
    /// Subscribers observe end-of-stream once drained; any native callback
    /// arriving afterwards is silently dropped.
    pub fn finish(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.events.lock().take().is_some() {
            tracing::debug!(
                connection_id = ?self.connection_id(),
                "notification bridge finished"
            );
        }
    }

    /// Whether the bridge has been finished
    pub fn is_finished(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn publish(&self, event: ConnectionEvent) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.events.lock();
        let Some(connection_id) = self.connection_id.get() else {
            tracing::warn!(?event, "dropping event for unassigned connection");
            return;
        };
        if let Some(tx) = guard.as_ref() {
            tracing::trace!(connection_id = %connection_id, ?event, "bridge event");
            // No receivers is fine: nobody has subscribed yet.
            let _ = tx.send(event);
        }
    }

    /// ICE gathering state changed
    pub fn ice_gathering_changed(&self, state: IceGatheringState) {
        self.publish(ConnectionEvent::IceGatheringChanged { state });
    }

    /// Signaling state changed
    pub fn signaling_changed(&self, state: SignalingState) {
        self.publish(ConnectionEvent::SignalingChanged { state });
    }

    /// A remote stream was attached
    pub fn stream_added(&self, stream_id: impl Into<String>) {
        self.publish(ConnectionEvent::StreamAdded {
            stream_id: stream_id.into(),
        });
    }

    /// A remote stream was detached
    pub fn stream_removed(&self, stream_id: impl Into<String>) {
        self.publish(ConnectionEvent::StreamRemoved {
            stream_id: stream_id.into(),
        });
    }

    /// ICE connection state changed
    pub fn ice_connection_changed(&self, state: IceConnectionState) {
        self.publish(ConnectionEvent::IceConnectionChanged { state });
    }

    /// Standardized ICE connection state changed
    pub fn ice_connection_standardized_changed(&self, state: IceConnectionState) {
        self.publish(ConnectionEvent::IceConnectionStandardizedChanged { state });
    }

    /// The engine discovered a local candidate
    pub fn candidate_generated(&self, candidate: IceCandidate) {
        self.publish(ConnectionEvent::IceCandidateGenerated { candidate });
    }

    /// The engine withdrew candidates
    pub fn candidates_removed(&self, count: usize) {
        self.publish(ConnectionEvent::IceCandidatesRemoved { count });
    }

    /// A remote receiver/track pair was added
    pub fn receiver_added(
        &self,
        kind: MediaKind,
        stream_ids: Vec<String>,
        track_id: impl Into<String>,
    ) {
        self.publish(ConnectionEvent::ReceiverAdded {
            kind,
            stream_ids,
            track_id: track_id.into(),
        });
    }

    /// The remote peer opened a data channel
    pub fn data_channel_opened(&self, label: impl Into<String>) {
        self.publish(ConnectionEvent::DataChannelOpened {
            label: label.into(),
        });
    }

    /// A data channel message arrived
    pub fn data_channel_message(&self, label: impl Into<String>, payload: Bytes) {
        self.publish(ConnectionEvent::DataChannelMessage {
            label: label.into(),
            payload,
        });
    }

    /// A data channel changed state
    pub fn data_channel_state_changed(&self, label: impl Into<String>, state: DataChannelState) {
        self.publish(ConnectionEvent::DataChannelStateChanged {
            label: label.into(),
            state,
        });
    }

    /// The engine wants renegotiation
    pub fn should_negotiate(&self) {
        self.publish(ConnectionEvent::ShouldNegotiate);
    }
}

impl Default for NotificationBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NotificationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBridge")
            .field("connection_id", &self.connection_id.get())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// One consumer's view of a bridge's event stream
pub struct EventSubscription {
    rx: Option<broadcast::Receiver<ConnectionEvent>>,
}

impl EventSubscription {
    /// Wait for the next event
    ///
    /// Returns `None` once the bridge is finished and the backlog drained.
    /// When the consumer lags behind the channel capacity the gap is skipped
    /// and the newest events are delivered.
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!(skipped, "event subscription lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

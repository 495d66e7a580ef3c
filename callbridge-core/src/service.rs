//! Call session orchestration
//!
//! [`CallService`] owns the engine handle, registry, pipeline, state machine
//! and the application's transport delegate, and reconciles the three event
//! sources (local actions, remote signaling, engine callbacks) into one
//! state timeline.

use crate::bridge::{ConnectionEvent, EventSubscription, IceConnectionState, NotificationBridge};
use crate::engine::MediaEngine;
use crate::negotiation::{NegotiationError, NegotiationPipeline};
use crate::registry::{ConnectionRecord, ConnectionRegistry, TrackRef};
use crate::sdp::{IceCandidate, SdpError, SdpType};
use crate::state_machine::{CallState, CallStateMachine, StateSubscription};
use crate::transport::{MediaDirective, TransportDelegate};
use crate::types::{Call, CallDirection, CallEndState, CallType, ConnectionId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Engine or connection setup failed
    #[error("initialization error: {0}")]
    Init(String),

    /// A call-level precondition was not met
    #[error("call error: {0}")]
    Call(String),

    /// No connection registered under the given id
    #[error("no connection registered for {0}")]
    ConnectionNotFound(ConnectionId),

    /// A remote payload failed validation
    #[error(transparent)]
    Sdp(#[from] SdpError),

    /// The negotiation pipeline failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The application's transport delegate failed
    #[error("transport delegate failed: {0}")]
    Transport(String),
}

/// Call service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallServiceConfig {
    /// Maximum simultaneously registered connections
    pub max_concurrent_connections: usize,
}

impl Default for CallServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 4,
        }
    }
}

/// Orchestrator for one account's call sessions
pub struct CallService {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<ConnectionRegistry>,
    pipeline: NegotiationPipeline,
    state: Arc<CallStateMachine>,
    delegate: Arc<dyn TransportDelegate>,
    config: CallServiceConfig,
}

impl CallService {
    /// Create a service over the given engine and transport delegate
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        delegate: Arc<dyn TransportDelegate>,
        config: CallServiceConfig,
    ) -> Self {
        Self {
            engine,
            registry: Arc::new(ConnectionRegistry::new()),
            pipeline: NegotiationPipeline::new(),
            state: Arc::new(CallStateMachine::new()),
            delegate,
            config,
        }
    }

    /// Create a builder
    pub fn builder(
        engine: Arc<dyn MediaEngine>,
        delegate: Arc<dyn TransportDelegate>,
    ) -> CallServiceBuilder {
        CallServiceBuilder::new(engine, delegate)
    }

    /// The connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Snapshot of the current call state
    pub async fn current_state(&self) -> CallState {
        self.state.current().await
    }

    /// Open a subscription to the call state sequence
    pub async fn subscribe_states(&self) -> StateSubscription {
        self.state.subscribe().await
    }

    /// Open a subscription to one connection's event stream
    pub async fn subscribe_connection_events(
        &self,
        connection_id: ConnectionId,
    ) -> Result<EventSubscription, ServiceError> {
        let record = self
            .registry
            .find(connection_id)
            .await
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        Ok(record.bridge.subscribe())
    }

    /// Start an outgoing call
    ///
    /// Opens a connection, negotiates an offer and hands it to the transport
    /// delegate. Drives the state machine `Ready` → `Connecting(Outbound)`.
    ///
    /// # Errors
    ///
    /// Negotiation and transport failures drive the state machine to
    /// `Failed` and are returned to the caller.
    #[tracing::instrument(skip(self, call), fields(shared_communication_id = %call.shared_communication_id()))]
    pub async fn start_outgoing_call(
        &self,
        call: Call,
        call_type: CallType,
    ) -> Result<ConnectionId, ServiceError> {
        tracing::info!("starting outgoing call");
        self.state
            .transition(CallState::Ready { call: call.clone() })
            .await;

        let record = match self.open_connection().await {
            Ok(record) => record,
            Err(e) => {
                self.fail_active_call(e.to_string()).await;
                return Err(e);
            }
        };
        let connection_id = record.id;

        match self.negotiate_outgoing(&record, &call, call_type).await {
            Ok(()) => {
                self.state
                    .transition(CallState::Connecting {
                        direction: CallDirection::Outbound(call_type),
                        call: call.clone(),
                    })
                    .await;
                if let Err(e) = self.delegate.update_metadata(&call).await {
                    tracing::warn!(error = %e, "metadata update failed");
                }
                tracing::info!(connection_id = %connection_id, "outgoing call negotiating");
                Ok(connection_id)
            }
            Err(e) => {
                self.fail_active_call(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn negotiate_outgoing(
        &self,
        record: &ConnectionRecord,
        call: &Call,
        call_type: CallType,
    ) -> Result<(), ServiceError> {
        self.pipeline
            .add_media_transceivers(record, true, call_type.has_video())
            .await?;
        let offer = self
            .pipeline
            .generate_offer(record, true, call_type.has_video())
            .await?;
        self.delegate
            .send_sdp(call.shared_communication_id(), &offer)
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Register validated inbound call metadata
    ///
    /// Drives the state machine to `Ready(call)`; the UI decides whether to
    /// answer.
    pub async fn handle_incoming_call(&self, call: Call) {
        tracing::info!(
            shared_communication_id = %call.shared_communication_id(),
            supports_video = call.supports_video(),
            "incoming call"
        );
        self.state.transition(CallState::Ready { call }).await;
    }

    /// Answer an incoming call with the remote peer's offer
    ///
    /// Opens a connection, applies the remote offer, negotiates an answer and
    /// hands it to the transport delegate. Drives the state machine to
    /// `Connecting(Inbound)`.
    ///
    /// # Errors
    ///
    /// Negotiation and transport failures drive the state machine to
    /// `Failed` and are returned to the caller.
    #[tracing::instrument(skip(self, call, remote_offer_sdp), fields(shared_communication_id = %call.shared_communication_id()))]
    pub async fn answer_incoming_call(
        &self,
        call: Call,
        remote_offer_sdp: &str,
    ) -> Result<ConnectionId, ServiceError> {
        let call_type = if call.supports_video() {
            CallType::Video
        } else {
            CallType::Voice
        };

        let record = match self.open_connection().await {
            Ok(record) => record,
            Err(e) => {
                self.fail_active_call(e.to_string()).await;
                return Err(e);
            }
        };
        let connection_id = record.id;

        let negotiate = async {
            self.pipeline
                .set_remote_sdp(&record, SdpType::Offer, remote_offer_sdp)
                .await?;
            let answer = self
                .pipeline
                .generate_answer(&record, true, call_type.has_video())
                .await?;
            self.delegate
                .send_sdp(call.shared_communication_id(), &answer)
                .await
                .map_err(|e| ServiceError::Transport(e.to_string()))?;
            Ok::<(), ServiceError>(())
        };

        match negotiate.await {
            Ok(()) => {
                self.state
                    .transition(CallState::Connecting {
                        direction: CallDirection::Inbound(call_type),
                        call,
                    })
                    .await;
                tracing::info!(connection_id = %connection_id, "incoming call negotiating");
                Ok(connection_id)
            }
            Err(e) => {
                self.state
                    .transition(CallState::Failed {
                        direction: Some(CallDirection::Inbound(call_type)),
                        call,
                        reason: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Apply a remote answer to an in-flight negotiation
    ///
    /// # Errors
    ///
    /// [`ServiceError::ConnectionNotFound`] for an unknown connection;
    /// pipeline errors otherwise.
    pub async fn handle_remote_answer(
        &self,
        connection_id: ConnectionId,
        remote_answer_sdp: &str,
    ) -> Result<(), ServiceError> {
        let record = self
            .registry
            .find(connection_id)
            .await
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        self.pipeline
            .set_remote_sdp(&record, SdpType::Answer, remote_answer_sdp)
            .await?;
        Ok(())
    }

    /// Validate and apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// [`ServiceError::Sdp`] when the payload fails the candidate
    /// construction invariants (the engine never sees it);
    /// [`ServiceError::ConnectionNotFound`] for an unknown connection;
    /// pipeline errors otherwise.
    pub async fn handle_remote_candidate(
        &self,
        connection_id: ConnectionId,
        candidate_id: i64,
        candidate_sdp: &str,
        sdp_mline_index: i32,
        sdp_mid: Option<String>,
    ) -> Result<(), ServiceError> {
        let candidate = IceCandidate::new(candidate_id, candidate_sdp, sdp_mline_index, sdp_mid)?;
        let record = self
            .registry
            .find(connection_id)
            .await
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;
        self.pipeline
            .apply_remote_candidate(&record, &candidate)
            .await?;
        Ok(())
    }

    /// End the active call
    ///
    /// Stamps the call, drives the state machine to `Ended`, notifies the
    /// remote peer for locally initiated ends, and tears everything down:
    /// state subscriptions finished, bridges finished, records removed,
    /// native handles released, in that order.
    ///
    /// Returns the ended call, or `None` when no call was active.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self, end_state: CallEndState) -> Option<Call> {
        let current = self.state.current().await;
        let mut call = current.call()?.clone();
        call.end(end_state);

        self.state
            .transition(CallState::Ended {
                end_state,
                call: call.clone(),
            })
            .await;

        let locally_initiated = matches!(end_state, CallEndState::HungUp | CallEndState::Declined);
        if locally_initiated {
            if let Err(e) = self.delegate.send_end_call(call.shared_communication_id()).await {
                tracing::warn!(error = %e, "failed to notify remote peer of call end");
            }
        }
        if let Err(e) = self.delegate.update_metadata(&call).await {
            tracing::warn!(error = %e, "metadata update failed");
        }

        self.shutdown_connections().await;
        tracing::info!(
            shared_communication_id = %call.shared_communication_id(),
            end_state = ?end_state,
            "call ended"
        );
        Some(call)
    }

    /// The remote peer hung up
    pub async fn handle_remote_hangup(&self) -> Option<Call> {
        self.end_call(CallEndState::RemoteHungUp).await
    }

    /// Another device on this account answered the call first
    ///
    /// Terminal: this device stops ringing and tears down, but sends no
    /// hangup: the call continues on the other device.
    pub async fn handle_answered_elsewhere(&self) -> Option<Call> {
        let current = self.state.current().await;
        let call = current.call()?.clone();

        self.state
            .transition(CallState::AnsweredElsewhere { call: call.clone() })
            .await;
        self.shutdown_connections().await;

        tracing::info!(
            shared_communication_id = %call.shared_communication_id(),
            "call answered on another device"
        );
        Some(call)
    }

    /// Drive the active call into `Failed`
    ///
    /// Does not tear down: the UI owns the decision of when to reset after a
    /// failure.
    pub async fn fail_active_call(&self, reason: impl Into<String>) -> bool {
        let current = self.state.current().await;
        let Some(call) = current.call() else {
            return false;
        };
        self.state
            .transition(CallState::Failed {
                direction: current.direction(),
                call: call.clone(),
                reason: reason.into(),
            })
            .await
    }

    /// Park the connected call on hold
    pub async fn hold_call(&self) -> bool {
        let current = self.state.current().await;
        if let CallState::Connected { direction, call } = current {
            self.state
                .transition(CallState::Held {
                    direction: Some(direction),
                    call,
                })
                .await
        } else {
            false
        }
    }

    /// Resume a held call
    pub async fn resume_call(&self) -> bool {
        let current = self.state.current().await;
        if let CallState::Held { direction, call } = current {
            let direction = match direction.or(self.state.direction().await) {
                Some(d) => d,
                None => return false,
            };
            self.state
                .transition(CallState::Connected { direction, call })
                .await
        } else {
            false
        }
    }

    /// Request a mid-call upgrade to video or downgrade to voice
    ///
    /// Notifies the remote peer, renegotiates the connection, and retags the
    /// local state's media type.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Call`] when no call is active; transport and pipeline
    /// errors otherwise.
    #[tracing::instrument(skip(self))]
    pub async fn request_media_change(
        &self,
        connection_id: ConnectionId,
        directive: MediaDirective,
    ) -> Result<(), ServiceError> {
        let current = self.state.current().await;
        let Some(call) = current.call().cloned() else {
            return Err(ServiceError::Call(
                "no active call to change media for".to_string(),
            ));
        };
        let record = self
            .registry
            .find(connection_id)
            .await
            .ok_or(ServiceError::ConnectionNotFound(connection_id))?;

        self.delegate
            .send_upgrade_downgrade(call.shared_communication_id(), directive)
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let has_video = directive.target_type().has_video();
        if has_video {
            self.pipeline
                .add_media_transceivers(&record, false, true)
                .await?;
        }
        let offer = self.pipeline.generate_offer(&record, true, has_video).await?;
        self.delegate
            .send_sdp(call.shared_communication_id(), &offer)
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if let CallState::Connected { direction, call } = current {
            self.state
                .transition(CallState::Connected {
                    direction: direction.with_type(directive.target_type()),
                    call,
                })
                .await;
        }
        Ok(())
    }

    /// The remote peer requested a media change
    ///
    /// Surfaces the momentary signal state so observers can react; the
    /// follow-up renegotiation arrives as a remote offer.
    pub async fn handle_remote_media_change(&self, directive: MediaDirective) -> bool {
        let signal = match directive {
            MediaDirective::UpgradeToVideo => CallState::ReceivedVideoUpgrade,
            MediaDirective::DowngradeToVoice => CallState::ReceivedVoiceDowngrade,
        };
        self.state.transition(signal).await
    }

    /// Reset the state machine between calls
    ///
    /// Finishes every state subscription and returns to `Waiting`.
    pub async fn reset(&self) {
        self.state.reset().await;
    }

    async fn open_connection(&self) -> Result<ConnectionRecord, ServiceError> {
        let active = self.registry.len().await;
        if active >= self.config.max_concurrent_connections {
            return Err(ServiceError::Call(format!(
                "maximum concurrent connections reached: {}",
                self.config.max_concurrent_connections
            )));
        }

        let connection_id = ConnectionId::new();
        let bridge = Arc::new(NotificationBridge::new());
        let session = self
            .engine
            .create_session(Arc::clone(&bridge))
            .await
            .map_err(|e| ServiceError::Init(e.to_string()))?;

        let record = ConnectionRecord::new(connection_id, session, Arc::clone(&bridge));
        self.registry.add(record.clone()).await;
        // Assigned only now: events fired during construction were dropped
        // on purpose, the connection was not registered yet.
        bridge.assign_connection_id(connection_id);
        self.spawn_event_pump(connection_id, bridge.subscribe());

        Ok(record)
    }

    fn spawn_event_pump(&self, connection_id: ConnectionId, subscription: EventSubscription) {
        let delegate = Arc::clone(&self.delegate);
        let state = Arc::clone(&self.state);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            pump_events(connection_id, subscription, delegate, state, registry).await;
        });
    }

    /// Finish subscriptions, finish bridges, drop records, release handles
    async fn shutdown_connections(&self) {
        self.state.reset().await;
        let records = self.registry.find_all().await;
        for record in &records {
            record.bridge.finish();
        }
        let records = self.registry.remove_all().await;
        let results = join_all(records.iter().map(|r| r.session.close())).await;
        for (record, result) in records.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    connection_id = %record.id,
                    error = %e,
                    "failed to release native session"
                );
            }
        }
    }
}

/// One connection's bridge-to-service event loop
async fn pump_events(
    connection_id: ConnectionId,
    mut subscription: EventSubscription,
    delegate: Arc<dyn TransportDelegate>,
    state: Arc<CallStateMachine>,
    registry: Arc<ConnectionRegistry>,
) {
    while let Some(event) = subscription.next().await {
        match event {
            ConnectionEvent::IceCandidateGenerated { candidate } => {
                let shared_id = state
                    .current()
                    .await
                    .call()
                    .map(|c| c.shared_communication_id().to_string());
                let Some(shared_id) = shared_id else {
                    tracing::debug!(
                        connection_id = %connection_id,
                        "dropping local candidate, no active call"
                    );
                    continue;
                };
                if let Err(e) = delegate.send_candidate(&shared_id, &candidate).await {
                    tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "failed to deliver local candidate"
                    );
                }
            }
            ConnectionEvent::IceConnectionChanged { state: ice_state } => match ice_state {
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    if let CallState::Connecting { direction, call } = state.current().await {
                        state
                            .transition(CallState::Connected { direction, call })
                            .await;
                    }
                }
                IceConnectionState::Failed => {
                    let current = state.current().await;
                    if let Some(call) = current.call() {
                        state
                            .transition(CallState::Failed {
                                direction: current.direction(),
                                call: call.clone(),
                                reason: "ICE connectivity failed".to_string(),
                            })
                            .await;
                    }
                }
                _ => {}
            },
            ConnectionEvent::ReceiverAdded {
                kind,
                stream_ids,
                track_id,
            } => {
                registry
                    .record_remote_track(
                        connection_id,
                        TrackRef {
                            id: track_id,
                            kind,
                            stream_ids,
                        },
                    )
                    .await;
            }
            ConnectionEvent::ShouldNegotiate => {
                tracing::debug!(
                    connection_id = %connection_id,
                    "engine requested renegotiation"
                );
            }
            other => {
                tracing::trace!(connection_id = %connection_id, event = ?other, "connection event");
            }
        }
    }
    tracing::debug!(connection_id = %connection_id, "event pump finished");
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder {
    engine: Arc<dyn MediaEngine>,
    delegate: Arc<dyn TransportDelegate>,
    config: CallServiceConfig,
}

impl CallServiceBuilder {
    /// Create a builder with the default configuration
    pub fn new(engine: Arc<dyn MediaEngine>, delegate: Arc<dyn TransportDelegate>) -> Self {
        Self {
            engine,
            delegate,
            config: CallServiceConfig::default(),
        }
    }

    /// Override the configuration
    #[must_use]
    pub fn with_config(mut self, config: CallServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service
    pub fn build(self) -> CallService {
        CallService::new(self.engine, self.delegate, self.config)
    }
}

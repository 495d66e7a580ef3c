//! Call service orchestration tests
//!
//! Drives full call flows through a scripted engine and transport delegate:
//! offer/answer negotiation, candidate fan-out, engine-event promotion of the
//! state machine, and teardown ordering.

use async_trait::async_trait;
use callbridge_core::{
    Call, CallEndState, CallService, CallServiceConfig, CallState, CallType, EngineError,
    IceCandidate, IceConnectionState, MediaDirective, MediaEngine, MediaKind, MediaSession,
    NotificationBridge, Participant, SdpType, ServiceError, SessionConstraints,
    SessionDescription,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const VALID_SDP: &str =
    "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

const HOST_CANDIDATE: &str = "candidate:1 1 udp 2122260223 192.168.1.17 51803 typ host";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn participant(name: &str) -> Participant {
    Participant::new(name, format!("{name}-nick"), format!("{name}-device")).unwrap()
}

fn call(shared_id: &str, video: bool) -> Call {
    Call::new(
        shared_id,
        participant("alice"),
        vec![participant("bob")],
        video,
    )
    .unwrap()
}

/// Engine session scripted for tests
#[derive(Default)]
struct MockSession {
    fail_offers: bool,
    remote_descriptions: AtomicUsize,
    local_descriptions: AtomicUsize,
    candidates: AtomicUsize,
    transceivers: AtomicUsize,
    closes: AtomicUsize,
}

#[async_trait]
impl MediaSession for MockSession {
    async fn create_offer(&self, _constraints: &SessionConstraints) -> Result<String, EngineError> {
        if self.fail_offers {
            return Err(EngineError::Operation("scripted offer failure".to_string()));
        }
        Ok(VALID_SDP.to_string())
    }

    async fn create_answer(
        &self,
        _constraints: &SessionConstraints,
    ) -> Result<String, EngineError> {
        Ok(VALID_SDP.to_string())
    }

    async fn set_local_description(
        &self,
        _description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.local_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.remote_descriptions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), EngineError> {
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_transceiver(&self, _kind: MediaKind) -> Result<(), EngineError> {
        self.transceivers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine that hands out scripted sessions and remembers their bridges
#[derive(Default)]
struct MockEngine {
    fail_offers: bool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    bridges: Mutex<Vec<Arc<NotificationBridge>>>,
}

impl MockEngine {
    fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }

    fn bridge(&self, index: usize) -> Arc<NotificationBridge> {
        Arc::clone(&self.bridges.lock().unwrap()[index])
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_session(
        &self,
        bridge: Arc<NotificationBridge>,
    ) -> Result<Arc<dyn MediaSession>, EngineError> {
        let session = Arc::new(MockSession {
            fail_offers: self.fail_offers,
            ..MockSession::default()
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        self.bridges.lock().unwrap().push(bridge);
        Ok(session)
    }
}

/// Transport delegate that records everything it is asked to deliver
#[derive(Default)]
struct RecordingDelegate {
    sdp: Mutex<Vec<(String, SdpType)>>,
    candidates: Mutex<Vec<(String, IceCandidate)>>,
    end_calls: Mutex<Vec<String>>,
    directives: Mutex<Vec<(String, MediaDirective)>>,
    metadata_updates: AtomicUsize,
}

#[async_trait]
impl callbridge_core::TransportDelegate for RecordingDelegate {
    async fn send_candidate(
        &self,
        shared_communication_id: &str,
        candidate: &IceCandidate,
    ) -> anyhow::Result<()> {
        self.candidates
            .lock()
            .unwrap()
            .push((shared_communication_id.to_string(), candidate.clone()));
        Ok(())
    }

    async fn send_sdp(
        &self,
        shared_communication_id: &str,
        description: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.sdp
            .lock()
            .unwrap()
            .push((shared_communication_id.to_string(), description.kind()));
        Ok(())
    }

    async fn send_end_call(&self, shared_communication_id: &str) -> anyhow::Result<()> {
        self.end_calls
            .lock()
            .unwrap()
            .push(shared_communication_id.to_string());
        Ok(())
    }

    async fn send_upgrade_downgrade(
        &self,
        shared_communication_id: &str,
        directive: MediaDirective,
    ) -> anyhow::Result<()> {
        self.directives
            .lock()
            .unwrap()
            .push((shared_communication_id.to_string(), directive));
        Ok(())
    }

    async fn update_metadata(&self, _call: &Call) -> anyhow::Result<()> {
        self.metadata_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn service_with(
    engine: Arc<MockEngine>,
    delegate: Arc<RecordingDelegate>,
) -> CallService {
    init_tracing();
    CallService::builder(engine, delegate).build()
}

/// Poll until `predicate` holds or a deadline passes
async fn eventually(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn outgoing_call_sends_one_offer_and_connects_state() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    let connection_id = service
        .start_outgoing_call(call("out-1", false), CallType::Voice)
        .await
        .unwrap();

    let state = service.current_state().await;
    assert!(matches!(state, CallState::Connecting { direction, .. } if !direction.is_inbound()));

    let sent = delegate.sdp.lock().unwrap().clone();
    assert_eq!(sent, vec![("out-1".to_string(), SdpType::Offer)]);

    let session = engine.session(0);
    assert_eq!(session.local_descriptions.load(Ordering::SeqCst), 1);
    assert_eq!(session.transceivers.load(Ordering::SeqCst), 1);

    assert!(service.registry().find(connection_id).await.is_some());
    assert_eq!(delegate.metadata_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn video_call_negotiates_audio_and_video_transceivers() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), delegate);

    service
        .start_outgoing_call(call("out-video", true), CallType::Video)
        .await
        .unwrap();

    assert_eq!(engine.session(0).transceivers.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn generated_candidates_are_forwarded_to_the_delegate() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    service
        .start_outgoing_call(call("out-cand", false), CallType::Voice)
        .await
        .unwrap();

    let bridge = engine.bridge(0);
    let candidate = IceCandidate::new(0, HOST_CANDIDATE, 0, Some("0".to_string())).unwrap();
    bridge.candidate_generated(candidate.clone());

    eventually("candidate delivery", || {
        !delegate.candidates.lock().unwrap().is_empty()
    })
    .await;

    let (shared_id, sent) = delegate.candidates.lock().unwrap()[0].clone();
    assert_eq!(shared_id, "out-cand");
    assert_eq!(sent, candidate);
}

/// Poll the service until its state matches `predicate` or a deadline passes
async fn wait_for_state(service: &CallService, what: &str, predicate: impl Fn(&CallState) -> bool) {
    for _ in 0..200 {
        if predicate(&service.current_state().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn ice_connectivity_promotes_connecting_to_connected() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), delegate);

    service
        .start_outgoing_call(call("out-ice", false), CallType::Voice)
        .await
        .unwrap();

    engine.bridge(0).ice_connection_changed(IceConnectionState::Connected);

    wait_for_state(&service, "connected state", |s| {
        matches!(s, CallState::Connected { .. })
    })
    .await;
}

#[tokio::test]
async fn ice_failure_drives_the_failed_state() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), delegate);

    service
        .start_outgoing_call(call("out-fail", false), CallType::Voice)
        .await
        .unwrap();

    engine.bridge(0).ice_connection_changed(IceConnectionState::Failed);

    wait_for_state(&service, "failed state", |s| {
        matches!(s, CallState::Failed { .. })
    })
    .await;

    // Failure is terminal until an explicit reset.
    assert!(!service.hold_call().await);
    service.reset().await;
    assert_eq!(service.current_state().await, CallState::Waiting);
}

#[tokio::test]
async fn answering_an_incoming_call_applies_offer_and_sends_answer() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    let incoming = call("in-1", true);
    service.handle_incoming_call(incoming.clone()).await;
    assert!(matches!(service.current_state().await, CallState::Ready { .. }));

    service
        .answer_incoming_call(incoming, VALID_SDP)
        .await
        .unwrap();

    let state = service.current_state().await;
    assert!(matches!(state, CallState::Connecting { direction, .. } if direction.is_inbound()));

    let session = engine.session(0);
    assert_eq!(session.remote_descriptions.load(Ordering::SeqCst), 1);
    assert_eq!(
        delegate.sdp.lock().unwrap().clone(),
        vec![("in-1".to_string(), SdpType::Answer)]
    );
}

#[tokio::test]
async fn remote_answer_and_candidates_reach_the_engine() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), delegate);

    let connection_id = service
        .start_outgoing_call(call("out-remote", false), CallType::Voice)
        .await
        .unwrap();

    service
        .handle_remote_answer(connection_id, VALID_SDP)
        .await
        .unwrap();
    service
        .handle_remote_candidate(connection_id, 0, HOST_CANDIDATE, 0, Some("0".to_string()))
        .await
        .unwrap();

    let session = engine.session(0);
    assert_eq!(session.remote_descriptions.load(Ordering::SeqCst), 1);
    assert_eq!(session.candidates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_remote_payloads_never_reach_the_engine() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), delegate);

    let connection_id = service
        .start_outgoing_call(call("out-bad", false), CallType::Voice)
        .await
        .unwrap();

    let bad_sdp = service.handle_remote_answer(connection_id, "junk").await;
    assert!(matches!(
        bad_sdp,
        Err(ServiceError::Negotiation(_)) | Err(ServiceError::Sdp(_))
    ));

    let bad_candidate = service
        .handle_remote_candidate(connection_id, -1, HOST_CANDIDATE, 0, None)
        .await;
    assert!(matches!(bad_candidate, Err(ServiceError::Sdp(_))));

    let session = engine.session(0);
    assert_eq!(session.remote_descriptions.load(Ordering::SeqCst), 0);
    assert_eq!(session.candidates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_connection_ids_are_reported() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(engine, delegate);

    let missing = callbridge_core::ConnectionId::new();
    assert!(matches!(
        service.handle_remote_answer(missing, VALID_SDP).await,
        Err(ServiceError::ConnectionNotFound(_))
    ));
    assert!(matches!(
        service
            .handle_remote_candidate(missing, 0, HOST_CANDIDATE, 0, None)
            .await,
        Err(ServiceError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn ending_a_call_tears_everything_down_in_order() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    service
        .start_outgoing_call(call("out-end", false), CallType::Voice)
        .await
        .unwrap();
    let mut states = service.subscribe_states().await;

    let ended = service.end_call(CallEndState::HungUp).await.unwrap();

    assert!(ended.has_ended());
    assert_eq!(ended.end_state(), Some(CallEndState::HungUp));
    assert!(ended.ended_at().unwrap() >= ended.created_at());

    // The subscriber sees the terminal state, then a clean end of sequence.
    let last = states.next().await.unwrap();
    assert!(matches!(last, CallState::Ended { .. }));
    assert_eq!(states.next().await, None);

    // Bridge finished, record removed, native handle released.
    assert!(engine.bridge(0).is_finished());
    assert!(service.registry().is_empty().await);
    assert_eq!(engine.session(0).closes.load(Ordering::SeqCst), 1);

    // Local hangup notifies the remote peer.
    assert_eq!(delegate.end_calls.lock().unwrap().clone(), vec!["out-end"]);
    assert_eq!(service.current_state().await, CallState::Waiting);
}

#[tokio::test]
async fn remote_hangup_does_not_echo_an_end_message() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(engine, Arc::clone(&delegate));

    service
        .start_outgoing_call(call("out-rh", false), CallType::Voice)
        .await
        .unwrap();

    let ended = service.handle_remote_hangup().await.unwrap();

    assert_eq!(ended.end_state(), Some(CallEndState::RemoteHungUp));
    assert!(delegate.end_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn answered_elsewhere_is_terminal_and_silent() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    let incoming = call("in-aux", false);
    service.handle_incoming_call(incoming).await;
    let mut states = service.subscribe_states().await;

    let taken_over = service.handle_answered_elsewhere().await.unwrap();

    assert_eq!(taken_over.shared_communication_id(), "in-aux");
    let last = states.next().await.unwrap();
    assert!(matches!(last, CallState::AnsweredElsewhere { .. }));
    assert_eq!(states.next().await, None);

    // No hangup goes out: the call continues on the other device.
    assert!(delegate.end_calls.lock().unwrap().is_empty());
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn media_upgrade_renegotiates_and_retags_the_call() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(Arc::clone(&engine), Arc::clone(&delegate));

    let connection_id = service
        .start_outgoing_call(call("out-upgrade", true), CallType::Voice)
        .await
        .unwrap();
    engine.bridge(0).ice_connection_changed(IceConnectionState::Connected);

    wait_for_state(&service, "connected state", |s| {
        matches!(s, CallState::Connected { .. })
    })
    .await;

    service
        .request_media_change(connection_id, MediaDirective::UpgradeToVideo)
        .await
        .unwrap();

    assert_eq!(
        delegate.directives.lock().unwrap().clone(),
        vec![("out-upgrade".to_string(), MediaDirective::UpgradeToVideo)]
    );
    // Initial offer plus the renegotiated one.
    assert_eq!(delegate.sdp.lock().unwrap().len(), 2);

    let state = service.current_state().await;
    let CallState::Connected { direction, .. } = state else {
        panic!("expected connected state, got {state:?}");
    };
    assert_eq!(direction.call_type(), CallType::Video);
}

#[tokio::test]
async fn remote_media_change_surfaces_the_signal_state() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(engine, delegate);

    service
        .start_outgoing_call(call("out-signal", true), CallType::Voice)
        .await
        .unwrap();

    assert!(
        service
            .handle_remote_media_change(MediaDirective::UpgradeToVideo)
            .await
    );
    assert_eq!(
        service.current_state().await,
        CallState::ReceivedVideoUpgrade
    );
}

#[tokio::test]
async fn negotiation_failure_fails_the_call_and_surfaces_the_error() {
    let engine = Arc::new(MockEngine {
        fail_offers: true,
        ..MockEngine::default()
    });
    let delegate = Arc::new(RecordingDelegate::default());
    let service = service_with(engine, delegate);

    let res = service
        .start_outgoing_call(call("out-broken", false), CallType::Voice)
        .await;

    assert!(matches!(res, Err(ServiceError::Negotiation(_))));
    assert!(matches!(
        service.current_state().await,
        CallState::Failed { .. }
    ));
}

#[tokio::test]
async fn concurrent_connection_limit_is_enforced() {
    let engine = Arc::new(MockEngine::default());
    let delegate = Arc::new(RecordingDelegate::default());
    init_tracing();
    let service = CallService::builder(engine, delegate)
        .with_config(CallServiceConfig {
            max_concurrent_connections: 1,
        })
        .build();

    service
        .start_outgoing_call(call("out-a", false), CallType::Voice)
        .await
        .unwrap();
    let second = service
        .start_outgoing_call(call("out-b", false), CallType::Voice)
        .await;

    assert!(
        matches!(second, Err(ServiceError::Call(ref msg)) if msg.contains("maximum concurrent"))
    );
}

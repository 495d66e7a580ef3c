//! Connection registry
//!
//! The single authoritative owner of connection records. All mutation is
//! serialized through one writer lock; other components may hold a cloned
//! snapshot for the duration of one operation, never an authoritative copy.

use crate::bridge::{MediaKind, NotificationBridge};
use crate::engine::MediaSession;
use crate::types::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lightweight reference to a media track
///
/// Rendering lives outside this core; only identity and routing data is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRef {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Streams the track belongs to
    pub stream_ids: Vec<String>,
}

/// One active negotiation: native handle, bridge and track references
#[derive(Clone)]
pub struct ConnectionRecord {
    /// Connection identifier
    pub id: ConnectionId,
    /// Native engine handle
    pub session: Arc<dyn MediaSession>,
    /// Event bridge for this connection
    pub bridge: Arc<NotificationBridge>,
    /// Most recent local track references
    pub local_tracks: Vec<TrackRef>,
    /// Most recent remote track references
    pub remote_tracks: Vec<TrackRef>,
}

impl ConnectionRecord {
    /// Create a record with no tracks yet
    pub fn new(
        id: ConnectionId,
        session: Arc<dyn MediaSession>,
        bridge: Arc<NotificationBridge>,
    ) -> Self {
        Self {
            id,
            session,
            bridge,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("local_tracks", &self.local_tracks)
            .field("remote_tracks", &self.remote_tracks)
            .finish()
    }
}

/// Authoritative map from connection id to [`ConnectionRecord`]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a record, replacing any record with the same id
    ///
    /// Duplicate ids happen legitimately during renegotiation, so this is a
    /// warning and a replace rather than an error. The replaced record's
    /// bridge is finished and its native session closed first, so a live
    /// engine handle can never be silently leaked by the swap.
    pub async fn add(&self, record: ConnectionRecord) {
        let mut connections = self.connections.write().await;
        let id = record.id;
        if let Some(old) = connections.insert(id, record) {
            tracing::warn!(
                connection_id = %id,
                "duplicate connection id, replacing existing record"
            );
            old.bridge.finish();
            if let Err(e) = old.session.close().await {
                tracing::warn!(
                    connection_id = %id,
                    error = %e,
                    "failed to close replaced session"
                );
            }
        } else {
            tracing::debug!(connection_id = %id, "connection registered");
        }
    }

    /// Look up a record by id
    pub async fn find(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Snapshot of every record
    pub async fn find_all(&self) -> Vec<ConnectionRecord> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Remove a record; absent ids are a quiet no-op
    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "connection removed");
        }
        removed
    }

    /// Remove every record
    pub async fn remove_all(&self) -> Vec<ConnectionRecord> {
        let mut connections = self.connections.write().await;
        let drained: Vec<_> = connections.drain().map(|(_, record)| record).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "all connections removed");
        }
        drained
    }

    /// Number of active records
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether there are no records
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Replace the stored local track references for a connection
    pub async fn set_local_tracks(&self, id: ConnectionId, tracks: Vec<TrackRef>) {
        if let Some(record) = self.connections.write().await.get_mut(&id) {
            record.local_tracks = tracks;
        }
    }

    /// Append a remote track reference for a connection
    pub async fn record_remote_track(&self, id: ConnectionId, track: TrackRef) {
        if let Some(record) = self.connections.write().await.get_mut(&id) {
            if !record.remote_tracks.iter().any(|t| t.id == track.id) {
                record.remote_tracks.push(track);
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, SessionConstraints};
    use crate::sdp::{IceCandidate, SessionDescription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Inert session that counts close calls
    #[derive(Default)]
    struct NullSession {
        close_calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaSession for NullSession {
        async fn create_offer(
            &self,
            _constraints: &SessionConstraints,
        ) -> Result<String, EngineError> {
            Err(EngineError::Operation("null session".to_string()))
        }

        async fn create_answer(
            &self,
            _constraints: &SessionConstraints,
        ) -> Result<String, EngineError> {
            Err(EngineError::Operation("null session".to_string()))
        }

        async fn set_local_description(
            &self,
            _description: &SessionDescription,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn set_remote_description(
            &self,
            _description: &SessionDescription,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), EngineError> {
            Ok(())
        }

        async fn add_transceiver(&self, _kind: MediaKind) -> Result<(), EngineError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record_with_session(id: ConnectionId) -> (ConnectionRecord, Arc<NullSession>) {
        let session = Arc::new(NullSession::default());
        let record = ConnectionRecord::new(
            id,
            Arc::clone(&session) as Arc<dyn MediaSession>,
            Arc::new(NotificationBridge::new()),
        );
        (record, session)
    }

    #[tokio::test]
    async fn add_and_find_round_trip() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (record, _) = record_with_session(id);

        registry.add(record).await;

        assert!(registry.find(id).await.is_some());
        assert_eq!(registry.len().await, 1);
        assert!(registry.find(ConnectionId::new()).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_add_replaces_and_tears_down_old_record() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (old_record, old_session) = record_with_session(id);
        let old_bridge = Arc::clone(&old_record.bridge);
        registry.add(old_record).await;

        let (new_record, new_session) = record_with_session(id);
        registry.add(new_record).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(old_session.close_calls.load(Ordering::SeqCst), 1);
        assert!(old_bridge.is_finished());
        assert_eq!(new_session.close_calls.load(Ordering::SeqCst), 0);

        // The survivor is the replacement, not the original.
        let found = registry.find(id).await.unwrap();
        assert!(!found.bridge.is_finished());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (record, _) = record_with_session(id);
        registry.add(record).await;

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_all_drains_everything() {
        let registry = ConnectionRegistry::new();
        for _ in 0..3 {
            let (record, _) = record_with_session(ConnectionId::new());
            registry.add(record).await;
        }

        let drained = registry.remove_all().await;
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty().await);
        assert!(registry.remove_all().await.is_empty());
    }

    #[tokio::test]
    async fn remote_tracks_are_recorded_once() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new();
        let (record, _) = record_with_session(id);
        registry.add(record).await;

        let track = TrackRef {
            id: "track-1".to_string(),
            kind: MediaKind::Video,
            stream_ids: vec!["stream-1".to_string()],
        };
        registry.record_remote_track(id, track.clone()).await;
        registry.record_remote_track(id, track.clone()).await;

        let found = registry.find(id).await.unwrap();
        assert_eq!(found.remote_tracks, vec![track]);
    }
}

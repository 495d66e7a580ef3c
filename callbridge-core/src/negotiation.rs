//! SDP/ICE negotiation pipeline
//!
//! Validates and orchestrates offer/answer creation and remote
//! description/candidate application. All engine-native failures are caught
//! here, translated into [`NegotiationError`], logged with connection
//! context, and rethrown; callers never see an engine error type, and
//! payloads that fail validation never reach the engine.

use crate::engine::{EngineError, SessionConstraints};
use crate::registry::ConnectionRecord;
use crate::sdp::{IceCandidate, SdpType, SessionDescription};
use thiserror::Error;

/// Negotiation failure taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The engine could not produce a usable offer/answer
    #[error("SDP generation failed: {0}")]
    GenerationFailed(String),

    /// The engine rejected a payload that passed our validation
    #[error("SDP parsing failed: {0}")]
    ParsingFailed(String),

    /// A remote payload failed structural validation
    #[error("invalid SDP format: {0}")]
    InvalidSdpFormat(String),

    /// A media kind the engine cannot express
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Constraints that enable no media at all
    #[error("invalid constraints: {0}")]
    InvalidConstraints(String),
}

/// Which pipeline operation an engine error occurred in
#[derive(Debug, Clone, Copy)]
enum Op {
    Generate,
    Apply,
}

fn translate(error: EngineError, op: Op) -> NegotiationError {
    match (error, op) {
        (EngineError::Unsupported(detail), _) => NegotiationError::UnsupportedMediaType(detail),
        (EngineError::Operation(detail), Op::Generate) => {
            NegotiationError::GenerationFailed(detail)
        }
        (EngineError::Operation(detail), Op::Apply) => NegotiationError::ParsingFailed(detail),
    }
}

/// Stateless orchestrator for one connection's negotiation operations
#[derive(Debug, Default, Clone, Copy)]
pub struct NegotiationPipeline;

impl NegotiationPipeline {
    /// Create a pipeline
    pub fn new() -> Self {
        Self
    }

    fn constraints(has_audio: bool, has_video: bool) -> Result<SessionConstraints, NegotiationError> {
        let constraints = SessionConstraints {
            audio: has_audio,
            video: has_video,
        };
        if !constraints.has_any() {
            return Err(NegotiationError::InvalidConstraints(
                "at least one of audio or video must be enabled".to_string(),
            ));
        }
        Ok(constraints)
    }

    /// Generate an offer, validate it, and apply it as local state
    ///
    /// # Errors
    ///
    /// [`NegotiationError::InvalidConstraints`] when neither medium is
    /// enabled; [`NegotiationError::GenerationFailed`] when the engine fails
    /// or hands back SDP that does not pass validation.
    pub async fn generate_offer(
        &self,
        record: &ConnectionRecord,
        has_audio: bool,
        has_video: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let constraints = Self::constraints(has_audio, has_video)?;
        let raw = record
            .session
            .create_offer(&constraints)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "generate_offer",
                    error = %e,
                    "engine failed to create offer"
                );
                translate(e, Op::Generate)
            })?;

        let description = SessionDescription::offer(raw).map_err(|e| {
            tracing::error!(
                connection_id = %record.id,
                operation = "generate_offer",
                error = %e,
                "engine produced an offer that fails validation"
            );
            NegotiationError::GenerationFailed(e.to_string())
        })?;

        record
            .session
            .set_local_description(&description)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "generate_offer",
                    error = %e,
                    "failed to apply local offer"
                );
                translate(e, Op::Generate)
            })?;

        tracing::debug!(connection_id = %record.id, "offer generated");
        Ok(description)
    }

    /// Generate an answer, validate it, and apply it as local state
    ///
    /// # Errors
    ///
    /// Same failure modes as [`generate_offer`](Self::generate_offer).
    pub async fn generate_answer(
        &self,
        record: &ConnectionRecord,
        has_audio: bool,
        has_video: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        let constraints = Self::constraints(has_audio, has_video)?;
        let raw = record
            .session
            .create_answer(&constraints)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "generate_answer",
                    error = %e,
                    "engine failed to create answer"
                );
                translate(e, Op::Generate)
            })?;

        let description = SessionDescription::answer(raw).map_err(|e| {
            tracing::error!(
                connection_id = %record.id,
                operation = "generate_answer",
                error = %e,
                "engine produced an answer that fails validation"
            );
            NegotiationError::GenerationFailed(e.to_string())
        })?;

        record
            .session
            .set_local_description(&description)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "generate_answer",
                    error = %e,
                    "failed to apply local answer"
                );
                translate(e, Op::Generate)
            })?;

        tracing::debug!(connection_id = %record.id, "answer generated");
        Ok(description)
    }

    /// Validate remote SDP text and apply it to the engine
    ///
    /// # Errors
    ///
    /// [`NegotiationError::InvalidSdpFormat`] when validation fails; the
    /// engine is never touched in that case. [`NegotiationError::ParsingFailed`]
    /// when the engine rejects a payload that passed validation.
    pub async fn set_remote_sdp(
        &self,
        record: &ConnectionRecord,
        kind: SdpType,
        sdp: &str,
    ) -> Result<SessionDescription, NegotiationError> {
        let description = SessionDescription::new(kind, sdp).map_err(|e| {
            tracing::warn!(
                connection_id = %record.id,
                operation = "set_remote_sdp",
                error = %e,
                "rejecting malformed remote SDP"
            );
            NegotiationError::InvalidSdpFormat(e.to_string())
        })?;

        record
            .session
            .set_remote_description(&description)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "set_remote_sdp",
                    error = %e,
                    "failed to apply remote description"
                );
                translate(e, Op::Apply)
            })?;

        tracing::debug!(connection_id = %record.id, kind = %kind, "remote description applied");
        Ok(description)
    }

    /// Hand an already-validated remote candidate to the engine
    ///
    /// # Errors
    ///
    /// [`NegotiationError::ParsingFailed`] when the engine rejects the
    /// candidate.
    pub async fn apply_remote_candidate(
        &self,
        record: &ConnectionRecord,
        candidate: &IceCandidate,
    ) -> Result<(), NegotiationError> {
        record
            .session
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "apply_remote_candidate",
                    candidate_id = candidate.id(),
                    error = %e,
                    "failed to apply remote candidate"
                );
                translate(e, Op::Apply)
            })?;

        tracing::trace!(
            connection_id = %record.id,
            candidate_id = candidate.id(),
            "remote candidate applied"
        );
        Ok(())
    }

    /// Add a transceiver for each enabled medium ahead of offer generation
    ///
    /// # Errors
    ///
    /// [`NegotiationError::InvalidConstraints`] when neither medium is
    /// enabled; [`NegotiationError::UnsupportedMediaType`] when the engine
    /// cannot express one of them.
    pub async fn add_media_transceivers(
        &self,
        record: &ConnectionRecord,
        has_audio: bool,
        has_video: bool,
    ) -> Result<(), NegotiationError> {
        let constraints = Self::constraints(has_audio, has_video)?;
        for kind in constraints.kinds() {
            record.session.add_transceiver(kind).await.map_err(|e| {
                tracing::error!(
                    connection_id = %record.id,
                    operation = "add_media_transceivers",
                    media_kind = %kind,
                    error = %e,
                    "failed to add transceiver"
                );
                translate(e, Op::Generate)
            })?;
        }
        Ok(())
    }
}

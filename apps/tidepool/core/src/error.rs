use std::time::Duration;

use thiserror::Error;

use crate::media::TrackKind;
use crate::negotiation::NegotiationState;
use crate::protocol::{CLOSE_INTERNAL_ERROR, CLOSE_PROTOCOL_ERROR};
use crate::registry::ConnectionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel is already registered as connection {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Failure of a single control channel. Handled by dropping the connection,
/// never propagated to other connections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),
    #[error("channel broken: {0}")]
    Broken(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unexpected {kind} message while {state}")]
    UnexpectedMessage {
        kind: &'static str,
        state: NegotiationState,
    },
    #[error("binary frames are not accepted on the signaling channel")]
    BinaryFrame,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaEngineError {
    #[error("media engine setup failed: {0}")]
    Setup(String),
    #[error("answer generation failed: {0}")]
    Answer(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("track setup failed: {0}")]
    Track(String),
    #[error("peer connectivity failed")]
    ConnectivityFailed,
    #[error("media engine already closed")]
    Closed,
}

/// Per-frame failure of a transform. Scoped to that frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameTransformError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("transform turned a {expected} frame into {actual}")]
    KindMismatch { expected: TrackKind, actual: TrackKind },
    #[error("transform failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("inbound track ended")]
    Ended,
    #[error("outbound track rejected frame: {0}")]
    Sink(String),
    #[error(transparent)]
    Transform(#[from] FrameTransformError),
}

/// Everything that can end a negotiation session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    MediaEngine(#[from] MediaEngineError),
    #[error("session already closed")]
    Closed,
}

impl SessionError {
    /// WebSocket close code reported to the affected client.
    pub fn close_code(&self) -> u16 {
        match self {
            SessionError::Protocol(_) => CLOSE_PROTOCOL_ERROR,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            SessionError::Protocol(ProtocolError::Malformed(_)) => "malformed",
            SessionError::Protocol(ProtocolError::UnexpectedMessage { .. }) => "out_of_state",
            SessionError::Protocol(ProtocolError::BinaryFrame) => "binary_frame",
            SessionError::MediaEngine(MediaEngineError::ConnectivityFailed) => {
                "connectivity_failed"
            }
            SessionError::MediaEngine(_) => "media_engine",
            SessionError::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn protocol_errors_close_with_protocol_code() {
        let err = SessionError::from(ProtocolError::UnexpectedMessage {
            kind: "offer",
            state: NegotiationState::Stable,
        });
        assert_eq!(err.close_code(), CLOSE_PROTOCOL_ERROR);
        assert_eq!(err.metric_label(), "out_of_state");
        assert_eq!(err.to_string(), "unexpected offer message while stable");
    }

    #[test_timeout::timeout]
    fn engine_errors_close_with_internal_code() {
        let err = SessionError::from(MediaEngineError::Answer("no codecs".into()));
        assert_eq!(err.close_code(), CLOSE_INTERNAL_ERROR);
        assert_eq!(err.metric_label(), "media_engine");
    }
}

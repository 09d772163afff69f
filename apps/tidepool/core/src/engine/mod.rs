//! Seam between negotiation and whatever terminates the media.
//!
//! [`NegotiationSession`](crate::NegotiationSession) only ever talks to a
//! [`MediaEngine`]; the WebRTC stack lives behind the `webrtc-engine` feature
//! and tests use the scripted engine in [`mock`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MediaEngineError;
use crate::media::{FrameSink, FrameSource, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription};

pub mod mock;
#[cfg(feature = "webrtc-engine")]
pub mod rtc;

/// STUN server handed to real engines when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(label)
    }
}

pub type ConnectivityHandler = Box<dyn Fn(ConnectivityState) + Send + Sync>;
pub type InboundTrackHandler = Box<dyn Fn(Box<dyn FrameSource>) + Send + Sync>;

/// One peer connection as seen by the negotiation state machine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Apply the remote offer and produce the local answer. The answer is
    /// already applied as the local description when this returns.
    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaEngineError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaEngineError>;

    fn on_connectivity_state_change(&self, handler: ConnectivityHandler);

    fn on_inbound_track(&self, handler: InboundTrackHandler);

    /// Sink for frames sent back to the peer on a track of `kind`.
    async fn add_outbound_track(
        &self,
        kind: TrackKind,
    ) -> Result<Arc<dyn FrameSink>, MediaEngineError>;

    /// Release the peer connection. Safe to call more than once.
    async fn close(&self) -> Result<(), MediaEngineError>;
}

/// Builds one engine per media session.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn MediaEngine>, MediaEngineError>;
}

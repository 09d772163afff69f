//! Core of the Tidepool signaling server.
//!
//! Two deployment shapes are built from the same pieces:
//!
//! * relay: a [`RoomDirectory`] of [`SessionRegistry`] instances and a
//!   [`MessageRelay`] that fans opaque negotiation messages out to every other
//!   connection in the room;
//! * media-terminating: a [`NegotiationSession`] per connection that answers
//!   the client's offer through a [`MediaEngine`] and loops inbound tracks back
//!   through a [`ProcessedTrack`] with a pluggable [`FrameTransform`].
//!
//! Nothing in this crate knows about HTTP or WebSockets; the transport layer
//! hands the [`endpoint`] drivers a stream of [`ChannelMessage`] values and
//! drains an outbound channel.

pub mod endpoint;
pub mod engine;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod relay;

pub use endpoint::{Disconnect, MediaEndpoint, RelayConnection, RelayEndpoint};
pub use engine::{ConnectivityState, MediaEngine, MediaEngineFactory};
pub use error::{
    FrameTransformError, MediaEngineError, PipelineError, ProtocolError, RegistryError,
    SessionError, TransportError,
};
pub use media::{Frame, FrameSink, FrameSource, FrameTransform, Passthrough, TimeBase, TrackKind};
pub use negotiation::{NegotiationSession, NegotiationState, SessionConfig};
pub use pipeline::{ProcessedTrack, PumpReport};
pub use protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use registry::{ConnectionHandle, ConnectionId, Registration, RoomDirectory, SessionRegistry};
pub use relay::{MessageRelay, RelayConfig, RelayOutcome};

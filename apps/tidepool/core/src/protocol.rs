use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Close code sent when the peer violated the signaling protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code sent when the server could not complete the session.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code sent when the relay dropped a connection that stopped draining.
pub const CLOSE_POLICY: u16 = 1008;
/// Close code sent to every open channel when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// One frame on a client's duplex control channel, independent of the
/// transport that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl ChannelMessage {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        ChannelMessage::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Payload size in bytes; control frames count as zero.
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
            ChannelMessage::Close { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ChannelMessage::Close { .. })
    }
}

impl From<&SignalingMessage> for ChannelMessage {
    fn from(message: &SignalingMessage) -> Self {
        ChannelMessage::Text(message.to_json())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Messages understood by the media-terminating endpoint.
///
/// The relay never parses these; it forwards whatever the client sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate(IceCandidate),
    /// Sent by the server before it closes a session on failure.
    Error {
        message: String,
    },
    /// Any `type` this server does not handle.
    #[serde(other, skip_serializing)]
    Unknown,
}

impl SignalingMessage {
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Malformed)
    }

    pub fn to_json(&self) -> String {
        // Every serializable variant is a plain string map.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
            SignalingMessage::Error { .. } => "error",
            SignalingMessage::Unknown => "unknown",
        }
    }
}

impl From<SessionDescription> for SignalingMessage {
    fn from(description: SessionDescription) -> Self {
        match description.kind {
            SdpType::Offer => SignalingMessage::Offer {
                sdp: description.sdp,
            },
            SdpType::Answer => SignalingMessage::Answer {
                sdp: description.sdp,
            },
        }
    }
}

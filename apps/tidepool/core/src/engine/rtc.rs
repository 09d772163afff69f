//! [`MediaEngine`] backed by the `webrtc` crate.
//!
//! Answers are non-trickle: `create_answer` waits for local candidate
//! gathering (bounded by [`WebRtcEngineConfig::gather_timeout`]) so the
//! returned SDP already carries the server's candidates. Loopback tracks are
//! attached before the remote offer is applied so they are part of the
//! answer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectivityHandler, ConnectivityState, InboundTrackHandler, MediaEngine, MediaEngineFactory,
    DEFAULT_ICE_SERVER,
};
use crate::error::{MediaEngineError, PipelineError};
use crate::media::{Frame, FrameSink, FrameSource, TimeBase, TrackKind};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

const LOOPBACK_STREAM_ID: &str = "tidepool-loopback";
const RTCP_READ_BUFFER: usize = 1500;

#[derive(Debug, Clone)]
pub struct WebRtcEngineConfig {
    pub ice_servers: Vec<String>,
    /// Kinds that get an outbound track for looping media back.
    pub loopback_kinds: Vec<TrackKind>,
    pub gather_timeout: Duration,
}

impl Default for WebRtcEngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            loopback_kinds: vec![TrackKind::Video],
            gather_timeout: Duration::from_secs(5),
        }
    }
}

pub struct WebRtcEngineFactory {
    api: API,
    config: WebRtcEngineConfig,
}

impl WebRtcEngineFactory {
    pub fn new(config: WebRtcEngineConfig) -> Result<Self, MediaEngineError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(setup_error)?;
        let interceptors =
            register_default_interceptors(Registry::new(), &mut codecs).map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(interceptors)
            .build();
        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn create(&self) -> Result<Arc<dyn MediaEngine>, MediaEngineError> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(setup_error)?,
        );

        let mut outbound = HashMap::new();
        for &kind in &self.config.loopback_kinds {
            match attach_loopback_track(&peer, kind).await {
                Ok(track) => {
                    outbound.insert(kind, track);
                }
                Err(err) => {
                    if let Err(close_err) = peer.close().await {
                        debug!(error = %close_err, "closing half-built peer connection failed");
                    }
                    return Err(err);
                }
            }
        }

        Ok(Arc::new(WebRtcEngine {
            peer,
            outbound,
            gather_timeout: self.config.gather_timeout,
            closed: AtomicBool::new(false),
        }) as Arc<dyn MediaEngine>)
    }
}

async fn attach_loopback_track(
    peer: &Arc<RTCPeerConnection>,
    kind: TrackKind,
) -> Result<Arc<TrackLocalStaticRTP>, MediaEngineError> {
    let track = Arc::new(TrackLocalStaticRTP::new(
        loopback_capability(kind),
        kind.as_str().to_string(),
        LOOPBACK_STREAM_ID.to_string(),
    ));
    let sender = peer
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|err| MediaEngineError::Track(err.to_string()))?;

    // Interceptors only run while RTCP is read off the sender.
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTCP_READ_BUFFER];
        while sender.read(&mut buf).await.is_ok() {}
    });
    Ok(track)
}

fn loopback_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
    }
}

fn setup_error(err: webrtc::Error) -> MediaEngineError {
    MediaEngineError::Setup(err.to_string())
}

fn answer_error(err: webrtc::Error) -> MediaEngineError {
    MediaEngineError::Answer(err.to_string())
}

fn connectivity_state(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            ConnectivityState::New
        }
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

pub struct WebRtcEngine {
    peer: Arc<RTCPeerConnection>,
    outbound: HashMap<TrackKind, Arc<TrackLocalStaticRTP>>,
    gather_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaEngineError> {
        if offer.kind != SdpType::Offer {
            return Err(MediaEngineError::Answer(
                "remote description is not an offer".into(),
            ));
        }
        let remote = RTCSessionDescription::offer(offer.sdp.clone()).map_err(answer_error)?;
        self.peer
            .set_remote_description(remote)
            .await
            .map_err(answer_error)?;

        let answer = self.peer.create_answer(None).await.map_err(answer_error)?;
        let mut gathered = self.peer.gathering_complete_promise().await;
        self.peer
            .set_local_description(answer)
            .await
            .map_err(answer_error)?;
        if timeout(self.gather_timeout, gathered.recv()).await.is_err() {
            warn!(
                timeout = ?self.gather_timeout,
                "candidate gathering did not finish; answering with what was gathered"
            );
        }

        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| MediaEngineError::Answer("no local description after answer".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaEngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|err| MediaEngineError::Candidate(err.to_string()))
    }

    fn on_connectivity_state_change(&self, handler: ConnectivityHandler) {
        let handler: Arc<dyn Fn(ConnectivityState) + Send + Sync> = Arc::from(handler);
        self.peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(connectivity_state(state));
                Box::pin(async {})
            }));
    }

    fn on_inbound_track(&self, handler: InboundTrackHandler) {
        let handler: Arc<dyn Fn(Box<dyn FrameSource>) + Send + Sync> = Arc::from(handler);
        self.peer
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                match RtpFrameSource::new(track) {
                    Some(source) => {
                        info!(
                            kind = %source.kind,
                            clock_rate = source.time_base.den,
                            "inbound track"
                        );
                        handler(Box::new(source));
                    }
                    None => warn!("ignoring inbound track of unknown kind"),
                }
                Box::pin(async {})
            }));
    }

    async fn add_outbound_track(
        &self,
        kind: TrackKind,
    ) -> Result<Arc<dyn FrameSink>, MediaEngineError> {
        let track = self.outbound.get(&kind).cloned().ok_or_else(|| {
            MediaEngineError::Track(format!("no outbound {kind} track was negotiated"))
        })?;
        Ok(Arc::new(RtpFrameSink { kind, track }) as Arc<dyn FrameSink>)
    }

    async fn close(&self) -> Result<(), MediaEngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.peer
            .close()
            .await
            .map_err(|err| MediaEngineError::Setup(err.to_string()))
    }
}

/// Inbound RTP track; one frame per RTP packet, timed by the codec clock.
struct RtpFrameSource {
    track: Arc<TrackRemote>,
    kind: TrackKind,
    time_base: TimeBase,
}

impl RtpFrameSource {
    fn new(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return None,
        };
        let clock_rate = track.codec().capability.clock_rate;
        Some(Self {
            track,
            kind,
            time_base: TimeBase::from_clock_rate(clock_rate),
        })
    }
}

#[async_trait]
impl FrameSource for RtpFrameSource {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn recv(&mut self) -> Result<Frame, PipelineError> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(Frame {
                kind: self.kind,
                pts: i64::from(packet.header.timestamp),
                time_base: self.time_base,
                data: packet.payload,
                sequence: packet.header.sequence_number,
                marker: packet.header.marker,
            }),
            Err(err) => {
                debug!(kind = %self.kind, error = %err, "inbound track closed");
                Err(PipelineError::Ended)
            }
        }
    }
}

struct RtpFrameSink {
    kind: TrackKind,
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl FrameSink for RtpFrameSink {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn send(&self, frame: &Frame) -> Result<(), PipelineError> {
        // The local track rewrites SSRC and payload type per binding.
        let packet = Packet {
            header: Header {
                version: 2,
                marker: frame.marker,
                sequence_number: frame.sequence,
                timestamp: frame.pts as u32,
                ..Default::default()
            },
            payload: frame.data.clone(),
        };
        self.track
            .write_rtp(&packet)
            .await
            .map(|_| ())
            .map_err(|err| PipelineError::Sink(err.to_string()))
    }
}

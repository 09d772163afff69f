//! Scripted [`MediaEngine`] for exercising negotiation without a network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectivityHandler, ConnectivityState, InboundTrackHandler, MediaEngine, MediaEngineFactory,
};
use crate::error::MediaEngineError;
use crate::media::{
    frame_channel, ChannelFrameSink, ChannelFrameSource, FrameSink, FrameSource, TrackKind,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

pub const MOCK_ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=tidepool-mock\r\nt=0 0\r\n";
const MOCK_TRACK_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub answer_sdp: String,
    /// When set, `create_answer` fails with this reason.
    pub answer_error: Option<String>,
    pub reject_candidates: bool,
    /// When set, the factory refuses to build engines.
    pub setup_error: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            answer_sdp: MOCK_ANSWER_SDP.to_string(),
            answer_error: None,
            reject_candidates: false,
            setup_error: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    remote_descriptions: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    close_calls: usize,
    connectivity: Option<Arc<dyn Fn(ConnectivityState) + Send + Sync>>,
    inbound: Option<Arc<dyn Fn(Box<dyn FrameSource>) + Send + Sync>>,
}

pub struct MockEngine {
    behavior: MockBehavior,
    state: Mutex<MockState>,
    outbound_tx: mpsc::UnboundedSender<ChannelFrameSource>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelFrameSource>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(MockBehavior::default())
    }
}

impl MockEngine {
    pub fn new(behavior: MockBehavior) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            behavior,
            state: Mutex::new(MockState::default()),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        }
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    /// Report a connectivity change as the peer connection would.
    pub fn emit_connectivity(&self, state: ConnectivityState) {
        let handler = self.state.lock().connectivity.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    /// Announce a remote track. Returns the sink that feeds it, or `None`
    /// when no inbound handler is installed.
    pub fn push_inbound_track(&self, kind: TrackKind) -> Option<ChannelFrameSink> {
        let handler = self.state.lock().inbound.clone()?;
        let (sink, source) = frame_channel(kind, MOCK_TRACK_CAPACITY);
        handler(Box::new(source));
        Some(sink)
    }

    /// Next outbound track the session attached, in attach order.
    pub async fn next_outbound_track(&self) -> Option<ChannelFrameSource> {
        self.outbound_rx.lock().await.recv().await
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaEngineError> {
        if offer.kind != SdpType::Offer {
            return Err(MediaEngineError::Answer("remote description is not an offer".into()));
        }
        let mut state = self.state.lock();
        if state.close_calls > 0 {
            return Err(MediaEngineError::Closed);
        }
        state.remote_descriptions.push(offer.clone());
        match &self.behavior.answer_error {
            Some(reason) => Err(MediaEngineError::Answer(reason.clone())),
            None => Ok(SessionDescription::answer(self.behavior.answer_sdp.clone())),
        }
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaEngineError> {
        if self.behavior.reject_candidates {
            return Err(MediaEngineError::Candidate(candidate.candidate.clone()));
        }
        self.state.lock().candidates.push(candidate.clone());
        Ok(())
    }

    fn on_connectivity_state_change(&self, handler: ConnectivityHandler) {
        self.state.lock().connectivity = Some(Arc::from(handler));
    }

    fn on_inbound_track(&self, handler: InboundTrackHandler) {
        self.state.lock().inbound = Some(Arc::from(handler));
    }

    async fn add_outbound_track(
        &self,
        kind: TrackKind,
    ) -> Result<Arc<dyn FrameSink>, MediaEngineError> {
        let (sink, source) = frame_channel(kind, MOCK_TRACK_CAPACITY);
        self.outbound_tx
            .send(source)
            .map_err(|_| MediaEngineError::Track("mock engine dropped".into()))?;
        Ok(Arc::new(sink))
    }

    async fn close(&self) -> Result<(), MediaEngineError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.connectivity = None;
        state.inbound = None;
        Ok(())
    }
}

/// Factory that remembers every engine it built.
#[derive(Default)]
pub struct MockEngineFactory {
    behavior: MockBehavior,
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }
}

#[async_trait]
impl MediaEngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<Arc<dyn MediaEngine>, MediaEngineError> {
        if let Some(reason) = &self.behavior.setup_error {
            return Err(MediaEngineError::Setup(reason.clone()));
        }
        let engine = Arc::new(MockEngine::new(self.behavior.clone()));
        self.engines.lock().push(engine.clone());
        Ok(engine as Arc<dyn MediaEngine>)
    }
}

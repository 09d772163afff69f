use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ConnectivityState, MediaEngine};
use crate::error::{MediaEngineError, ProtocolError, SessionError};
use crate::media::{FrameSource, FrameTransform, TrackKind};
use crate::pipeline::{self, ProcessedTrack, PumpReport};
use crate::protocol::{IceCandidate, SessionDescription, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inbound track kinds that are transformed and sent back to the peer.
    pub loopback_kinds: Vec<TrackKind>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loopback_kinds: vec![TrackKind::Video],
        }
    }
}

/// Callback from the media engine, queued for the session's control loop.
pub enum EngineEvent {
    Connectivity(ConnectivityState),
    InboundTrack(Box<dyn FrameSource>),
}

/// Negotiation context for one media-terminating connection.
///
/// The session answers exactly one offer. Any error moves it to
/// [`NegotiationState::Closed`], which aborts its pipelines and releases the
/// engine; dropping an open session does the same from a spawned task.
pub struct NegotiationSession {
    id: u64,
    state: NegotiationState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    engine: Arc<dyn MediaEngine>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    transform: Arc<dyn FrameTransform>,
    config: SessionConfig,
    pipelines: Vec<JoinHandle<PumpReport>>,
}

impl NegotiationSession {
    pub fn new(
        id: u64,
        engine: Arc<dyn MediaEngine>,
        transform: Arc<dyn FrameTransform>,
        config: SessionConfig,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();

        let connectivity_tx = tx.clone();
        engine.on_connectivity_state_change(Box::new(move |state| {
            let _ = connectivity_tx.send(EngineEvent::Connectivity(state));
        }));
        engine.on_inbound_track(Box::new(move |source| {
            let _ = tx.send(EngineEvent::InboundTrack(source));
        }));

        debug!(session_id = id, "negotiation session created");
        Self {
            id,
            state: NegotiationState::Idle,
            local: None,
            remote: None,
            pending_candidates: Vec::new(),
            engine,
            events,
            transform,
            config,
            pipelines: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn active_pipelines(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Parse and apply one text frame from the client. Returns the reply to
    /// send back, if any.
    pub async fn handle_text(
        &mut self,
        raw: &str,
    ) -> Result<Option<SignalingMessage>, SessionError> {
        if self.state == NegotiationState::Closed {
            return Err(SessionError::Closed);
        }
        match SignalingMessage::from_json(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => {
                let err = SessionError::from(err);
                self.fail(&err).await;
                Err(err)
            }
        }
    }

    pub async fn handle_message(
        &mut self,
        message: SignalingMessage,
    ) -> Result<Option<SignalingMessage>, SessionError> {
        if self.state == NegotiationState::Closed {
            return Err(SessionError::Closed);
        }
        let kind = message.kind();
        let result = match message {
            SignalingMessage::Offer { sdp } => self
                .accept_offer(SessionDescription::offer(sdp))
                .await
                .map(Some),
            SignalingMessage::IceCandidate(candidate) => {
                self.add_candidate(candidate).await.map(|()| None)
            }
            SignalingMessage::Answer { .. } => Err(ProtocolError::UnexpectedMessage {
                kind,
                state: self.state,
            }
            .into()),
            SignalingMessage::Error { message } => {
                warn!(session_id = self.id, %message, "client reported an error");
                Ok(None)
            }
            SignalingMessage::Unknown => {
                warn!(session_id = self.id, "ignoring signaling message of unknown type");
                Ok(None)
            }
        };

        if let Err(err) = &result {
            self.fail(err).await;
        }
        result
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SignalingMessage, SessionError> {
        if self.state != NegotiationState::Idle {
            return Err(ProtocolError::UnexpectedMessage {
                kind: "offer",
                state: self.state,
            }
            .into());
        }

        self.remote = Some(offer.clone());
        self.transition(NegotiationState::HaveRemoteOffer);

        let answer = self.engine.create_answer(&offer).await?;
        self.local = Some(answer.clone());
        self.transition(NegotiationState::HaveLocalAnswer);

        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.engine.add_ice_candidate(&candidate).await?;
        }
        self.transition(NegotiationState::Stable);
        Ok(SignalingMessage::from(answer))
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        if self.state == NegotiationState::Stable {
            self.engine.add_ice_candidate(&candidate).await?;
        } else {
            debug!(
                session_id = self.id,
                state = %self.state,
                buffered = self.pending_candidates.len() + 1,
                "buffering candidate until descriptions are set"
            );
            self.pending_candidates.push(candidate);
        }
        Ok(())
    }

    /// Wait for the next engine callback. Resolves to `None` once the engine
    /// has dropped its handlers.
    pub async fn next_engine_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), SessionError> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        match event {
            EngineEvent::Connectivity(state) => {
                info!(session_id = self.id, connectivity = %state, "peer connectivity changed");
                if state == ConnectivityState::Failed {
                    let err = SessionError::from(MediaEngineError::ConnectivityFailed);
                    self.fail(&err).await;
                    return Err(err);
                }
                Ok(())
            }
            EngineEvent::InboundTrack(source) => {
                let result = self.attach_track(source).await;
                if let Err(err) = &result {
                    self.fail(err).await;
                }
                result
            }
        }
    }

    async fn attach_track(&mut self, source: Box<dyn FrameSource>) -> Result<(), SessionError> {
        let kind = source.kind();
        if !self.config.loopback_kinds.contains(&kind) {
            debug!(session_id = self.id, %kind, "inbound track is not looped back");
            return Ok(());
        }

        let sink = self.engine.add_outbound_track(kind).await?;
        let track = ProcessedTrack::new(source, Arc::clone(&self.transform));
        self.pipelines.push(tokio::spawn(pipeline::pump(track, sink)));
        info!(session_id = self.id, %kind, "looping inbound track back to peer");
        Ok(())
    }

    /// Move to `Closed`, stop every pipeline and release the engine.
    /// Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.transition(NegotiationState::Closed);
        self.pending_candidates.clear();
        for handle in self.pipelines.drain(..) {
            handle.abort();
        }
        if let Err(err) = self.engine.close().await {
            warn!(session_id = self.id, error = %err, "failed to release media engine");
        }
    }

    /// Close the session because of a failure detected outside of it, such
    /// as a frame the transport could not hand over as text.
    pub async fn abort(&mut self, err: SessionError) -> SessionError {
        if self.state != NegotiationState::Closed {
            self.fail(&err).await;
        }
        err
    }

    async fn fail(&mut self, err: &SessionError) {
        counter!("tidepool_session_errors_total", 1, "reason" => err.metric_label());
        warn!(
            session_id = self.id,
            state = %self.state,
            error = %err,
            "closing negotiation session"
        );
        self.close().await;
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(
            session_id = self.id,
            from = %self.state,
            to = %next,
            "negotiation state changed"
        );
        self.state = next;
    }
}

impl Drop for NegotiationSession {
    fn drop(&mut self) {
        for handle in self.pipelines.drain(..) {
            handle.abort();
        }
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;

        let engine = Arc::clone(&self.engine);
        let id = self.id;
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = engine.close().await {
                        warn!(session_id = id, error = %err, "failed to release media engine");
                    }
                });
            }
            Err(_) => warn!(session_id = id, "session dropped outside a runtime; engine not released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBehavior, MockEngine, MOCK_ANSWER_SDP};
    use crate::media::Passthrough;
    use crate::protocol::SdpType;
    use serde_json::json;

    fn session_with(behavior: MockBehavior) -> (NegotiationSession, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new(behavior));
        let session = NegotiationSession::new(
            1,
            engine.clone(),
            Arc::new(Passthrough),
            SessionConfig::default(),
        );
        (session, engine)
    }

    fn offer() -> String {
        json!({"type": "offer", "sdp": "v=0\r\no=- client offer\r\n"}).to_string()
    }

    fn candidate(n: u16) -> String {
        json!({
            "type": "ice-candidate",
            "candidate": format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            "sdpMid": "0",
            "sdpMLineIndex": 0
        })
        .to_string()
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_reaches_stable_with_one_answer() {
        let (mut session, engine) = session_with(MockBehavior::default());
        let reply = session.handle_text(&offer()).await.unwrap();

        assert_eq!(
            reply,
            Some(SignalingMessage::Answer {
                sdp: MOCK_ANSWER_SDP.into()
            })
        );
        assert_eq!(session.state(), NegotiationState::Stable);
        assert_eq!(session.remote_description().map(|d| d.kind), Some(SdpType::Offer));
        assert_eq!(session.local_description().map(|d| d.kind), Some(SdpType::Answer));
        assert_eq!(engine.remote_descriptions().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_are_applied_in_order_once_stable() {
        let (mut session, engine) = session_with(MockBehavior::default());
        assert_eq!(session.handle_text(&candidate(1)).await.unwrap(), None);
        assert_eq!(session.handle_text(&candidate(2)).await.unwrap(), None);
        assert_eq!(session.pending_candidates(), 2);
        assert!(engine.candidates().is_empty());

        session.handle_text(&offer()).await.unwrap();
        session.handle_text(&candidate(3)).await.unwrap();

        let applied: Vec<String> = engine
            .candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied.len(), 3);
        assert!(applied[0].starts_with("candidate:1 "));
        assert!(applied[1].starts_with("candidate:2 "));
        assert!(applied[2].starts_with("candidate:3 "));
        assert_eq!(session.pending_candidates(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_offer_closes_the_session() {
        let (mut session, engine) = session_with(MockBehavior::default());
        session.handle_text(&offer()).await.unwrap();

        let err = session.handle_text(&offer()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnexpectedMessage {
                kind: "offer",
                state: NegotiationState::Stable
            })
        ));
        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(engine.close_calls(), 1);
        assert!(matches!(
            session.handle_text(&candidate(1)).await,
            Err(SessionError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn inbound_answer_is_out_of_state() {
        let (mut session, _engine) = session_with(MockBehavior::default());
        let err = session
            .handle_text(r#"{"type":"answer","sdp":"v=0"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.metric_label(), "out_of_state");
        assert_eq!(session.state(), NegotiationState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_and_unknown_messages() {
        let (mut session, _engine) = session_with(MockBehavior::default());
        assert_eq!(session.handle_text(r#"{"type":"bye"}"#).await.unwrap(), None);
        assert_eq!(session.state(), NegotiationState::Idle);

        let err = session.handle_text("{not json").await.unwrap_err();
        assert_eq!(err.metric_label(), "malformed");
        assert_eq!(session.state(), NegotiationState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_failure_releases_engine() {
        let (mut session, engine) = session_with(MockBehavior {
            answer_error: Some("no shared codecs".into()),
            ..Default::default()
        });
        let err = session.handle_text(&offer()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::MediaEngine(MediaEngineError::Answer(_))
        ));
        assert_eq!(session.state(), NegotiationState::Closed);
        assert!(engine.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_candidate_closes_stable_session() {
        let (mut session, engine) = session_with(MockBehavior {
            reject_candidates: true,
            ..Default::default()
        });
        session.handle_text(&offer()).await.unwrap();
        assert_eq!(session.state(), NegotiationState::Stable);

        let err = session.handle_text(&candidate(1)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::MediaEngine(MediaEngineError::Candidate(_))
        ));
        assert_eq!(err.metric_label(), "media_engine");
        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(engine.close_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_buffered_candidate_fails_the_offer() {
        let (mut session, engine) = session_with(MockBehavior {
            reject_candidates: true,
            ..Default::default()
        });
        assert_eq!(session.handle_text(&candidate(1)).await.unwrap(), None);
        assert_eq!(session.pending_candidates(), 1);

        let err = session.handle_text(&offer()).await.unwrap_err();
        assert_eq!(err.metric_label(), "media_engine");
        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(session.pending_candidates(), 0);
        assert_eq!(engine.close_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn connectivity_failure_closes_session() {
        let (mut session, engine) = session_with(MockBehavior::default());
        session.handle_text(&offer()).await.unwrap();

        engine.emit_connectivity(ConnectivityState::Connected);
        let event = session.next_engine_event().await.unwrap();
        session.handle_engine_event(event).await.unwrap();
        assert_eq!(session.state(), NegotiationState::Stable);

        engine.emit_connectivity(ConnectivityState::Failed);
        let event = session.next_engine_event().await.unwrap();
        let err = session.handle_engine_event(event).await.unwrap_err();
        assert_eq!(err.metric_label(), "connectivity_failed");
        assert_eq!(session.state(), NegotiationState::Closed);
        assert!(engine.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn only_video_is_looped_back_by_default() {
        let (mut session, engine) = session_with(MockBehavior::default());
        session.handle_text(&offer()).await.unwrap();

        let _audio = engine.push_inbound_track(TrackKind::Audio).unwrap();
        let event = session.next_engine_event().await.unwrap();
        session.handle_engine_event(event).await.unwrap();
        assert_eq!(session.active_pipelines(), 0);

        let _video = engine.push_inbound_track(TrackKind::Video).unwrap();
        let event = session.next_engine_event().await.unwrap();
        session.handle_engine_event(event).await.unwrap();
        assert_eq!(session.active_pipelines(), 1);

        session.close().await;
        session.close().await;
        assert_eq!(engine.close_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_an_open_session_releases_engine() {
        let (mut session, engine) = session_with(MockBehavior::default());
        session.handle_text(&offer()).await.unwrap();
        drop(session);

        for _ in 0..100 {
            if engine.is_closed() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("engine was not released after drop");
    }
}

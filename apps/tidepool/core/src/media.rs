use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{FrameTransformError, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of a frame's presentation timestamp, `num / den` seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Time base of an RTP clock, e.g. 90 kHz for video.
    pub const fn from_clock_rate(clock_rate: u32) -> Self {
        Self::new(1, clock_rate)
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// One media frame travelling through a [`crate::ProcessedTrack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: TrackKind,
    pub pts: i64,
    pub time_base: TimeBase,
    pub data: Bytes,
    pub sequence: u16,
    /// Last packet of a video frame, or start of a talkspurt for audio.
    pub marker: bool,
}

impl Frame {
    pub fn new(kind: TrackKind, pts: i64, time_base: TimeBase, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            pts,
            time_base,
            data: data.into(),
            sequence: 0,
            marker: false,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }
}

/// Inbound side of a media track.
#[async_trait]
pub trait FrameSource: Send {
    fn kind(&self) -> TrackKind;

    /// Next frame, or [`PipelineError::Ended`] once the track is gone.
    async fn recv(&mut self) -> Result<Frame, PipelineError>;
}

/// Outbound side of a media track.
#[async_trait]
pub trait FrameSink: Send + Sync {
    fn kind(&self) -> TrackKind;

    async fn send(&self, frame: &Frame) -> Result<(), PipelineError>;
}

/// Synchronous per-frame transform applied between an inbound and outbound
/// track. Must not change the frame's kind.
pub trait FrameTransform: Send + Sync {
    fn apply(&self, frame: Frame) -> Result<Frame, FrameTransformError>;
}

impl<F> FrameTransform for F
where
    F: Fn(Frame) -> Result<Frame, FrameTransformError> + Send + Sync,
{
    fn apply(&self, frame: Frame) -> Result<Frame, FrameTransformError> {
        self(frame)
    }
}

/// Identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl FrameTransform for Passthrough {
    fn apply(&self, frame: Frame) -> Result<Frame, FrameTransformError> {
        Ok(frame)
    }
}

/// In-memory track pair. Used by the mock engine and by tests that drive a
/// pipeline without a peer connection.
pub fn frame_channel(kind: TrackKind, capacity: usize) -> (ChannelFrameSink, ChannelFrameSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelFrameSink { kind, tx },
        ChannelFrameSource { kind, rx },
    )
}

#[derive(Debug, Clone)]
pub struct ChannelFrameSink {
    kind: TrackKind,
    tx: mpsc::Sender<Frame>,
}

#[async_trait]
impl FrameSink for ChannelFrameSink {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn send(&self, frame: &Frame) -> Result<(), PipelineError> {
        self.tx
            .send(frame.clone())
            .await
            .map_err(|_| PipelineError::Sink(format!("{} track receiver dropped", self.kind)))
    }
}

#[derive(Debug)]
pub struct ChannelFrameSource {
    kind: TrackKind,
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn recv(&mut self) -> Result<Frame, PipelineError> {
        self.rx.recv().await.ok_or(PipelineError::Ended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn closures_are_transforms() {
        let invert = |mut frame: Frame| {
            frame.data = frame.data.iter().map(|b| !b).collect::<Vec<u8>>().into();
            Ok::<_, FrameTransformError>(frame)
        };
        let frame = Frame::new(
            TrackKind::Video,
            10,
            TimeBase::from_clock_rate(90_000),
            vec![0u8, 255],
        );
        let out = invert.apply(frame).unwrap();
        assert_eq!(out.data.as_ref(), &[255u8, 0]);
        assert_eq!(out.time_base.to_string(), "1/90000");
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_source_ends_when_sink_drops() {
        let (sink, mut source) = frame_channel(TrackKind::Audio, 2);
        let frame = Frame::new(
            TrackKind::Audio,
            960,
            TimeBase::from_clock_rate(48_000),
            vec![1u8],
        );
        sink.send(&frame).await.unwrap();
        drop(sink);
        assert_eq!(source.recv().await.unwrap(), frame);
        assert_eq!(source.recv().await.unwrap_err(), PipelineError::Ended);
    }
}

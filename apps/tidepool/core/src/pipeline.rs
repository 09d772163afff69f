use std::sync::Arc;

use metrics::counter;
use tracing::{debug, trace, warn};

use crate::error::{FrameTransformError, PipelineError};
use crate::media::{Frame, FrameSink, FrameSource, FrameTransform, TrackKind};

/// An inbound track with a transform applied to each frame it yields.
///
/// Output frames keep the input's presentation timestamp and time base no
/// matter what the transform does to them.
pub struct ProcessedTrack {
    source: Box<dyn FrameSource>,
    transform: Arc<dyn FrameTransform>,
}

impl ProcessedTrack {
    pub fn new(source: Box<dyn FrameSource>, transform: Arc<dyn FrameTransform>) -> Self {
        Self { source, transform }
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    /// Pull one frame and transform it.
    ///
    /// A [`PipelineError::Transform`] concerns only that frame; the caller may
    /// keep receiving. Every other error means the track is finished.
    pub async fn recv(&mut self) -> Result<Frame, PipelineError> {
        let input = self.source.recv().await?;
        let kind = input.kind;
        let pts = input.pts;
        let time_base = input.time_base;

        let mut output = self.transform.apply(input)?;
        if output.kind != kind {
            return Err(FrameTransformError::KindMismatch {
                expected: kind,
                actual: output.kind,
            }
            .into());
        }
        output.pts = pts;
        output.time_base = time_base;
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub kind: TrackKind,
    pub forwarded: u64,
    pub dropped: u64,
    /// Why the pump stopped. `None` when the inbound track ended cleanly.
    pub error: Option<PipelineError>,
}

/// Forward frames from `track` to `sink` until either side finishes.
pub async fn pump(mut track: ProcessedTrack, sink: Arc<dyn FrameSink>) -> PumpReport {
    let kind = track.kind();
    let mut report = PumpReport {
        kind,
        forwarded: 0,
        dropped: 0,
        error: None,
    };
    debug!(%kind, "media pipeline started");

    loop {
        let frame = match track.recv().await {
            Ok(frame) => frame,
            Err(PipelineError::Transform(err)) => {
                report.dropped += 1;
                counter!("tidepool_frames_dropped_total", 1, "kind" => kind.as_str());
                trace!(%kind, error = %err, "dropping frame");
                continue;
            }
            Err(PipelineError::Ended) => break,
            Err(err) => {
                report.error = Some(err);
                break;
            }
        };

        if let Err(err) = sink.send(&frame).await {
            report.error = Some(err);
            break;
        }
        report.forwarded += 1;
        counter!("tidepool_frames_transformed_total", 1, "kind" => kind.as_str());
    }

    match &report.error {
        None => debug!(
            %kind,
            forwarded = report.forwarded,
            dropped = report.dropped,
            "media pipeline finished"
        ),
        Some(err) => warn!(
            %kind,
            forwarded = report.forwarded,
            dropped = report.dropped,
            error = %err,
            "media pipeline stopped"
        ),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{frame_channel, Passthrough, TimeBase};

    fn video(pts: i64, data: &'static [u8]) -> Frame {
        Frame::new(
            TrackKind::Video,
            pts,
            TimeBase::from_clock_rate(90_000),
            data,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn transform_output_keeps_input_timing() {
        let (sink, source) = frame_channel(TrackKind::Video, 4);
        let retime = |mut frame: Frame| {
            frame.pts = 0;
            frame.time_base = TimeBase::new(1, 1000);
            frame.data = bytes::Bytes::from_static(b"edited");
            Ok::<_, FrameTransformError>(frame)
        };
        let mut track = ProcessedTrack::new(Box::new(source), Arc::new(retime));

        sink.send(&video(3_000, b"raw")).await.unwrap();
        let out = track.recv().await.unwrap();
        assert_eq!(out.pts, 3_000);
        assert_eq!(out.time_base, TimeBase::from_clock_rate(90_000));
        assert_eq!(&out.data[..], b"edited");
    }

    #[test_timeout::tokio_timeout_test]
    async fn kind_change_is_rejected() {
        let (sink, source) = frame_channel(TrackKind::Video, 4);
        let to_audio = |mut frame: Frame| {
            frame.kind = TrackKind::Audio;
            Ok::<_, FrameTransformError>(frame)
        };
        let mut track = ProcessedTrack::new(Box::new(source), Arc::new(to_audio));

        sink.send(&video(1, b"x")).await.unwrap();
        assert_eq!(
            track.recv().await.unwrap_err(),
            PipelineError::Transform(FrameTransformError::KindMismatch {
                expected: TrackKind::Video,
                actual: TrackKind::Audio,
            })
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn pump_skips_bad_frames_and_stops_when_track_ends() {
        let (inbound_tx, inbound) = frame_channel(TrackKind::Video, 8);
        let (outbound, mut outbound_rx) = frame_channel(TrackKind::Video, 8);
        let reject_empty = |frame: Frame| {
            if frame.data.is_empty() {
                Err(FrameTransformError::Malformed("empty payload".into()))
            } else {
                Ok(frame)
            }
        };
        let track = ProcessedTrack::new(Box::new(inbound), Arc::new(reject_empty));

        inbound_tx.send(&video(1, b"a")).await.unwrap();
        inbound_tx.send(&video(2, b"")).await.unwrap();
        inbound_tx.send(&video(3, b"c")).await.unwrap();
        drop(inbound_tx);

        let report = pump(track, Arc::new(outbound)).await;
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.error, None);

        assert_eq!(outbound_rx.recv().await.unwrap().pts, 1);
        assert_eq!(outbound_rx.recv().await.unwrap().pts, 3);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pump_stops_when_sink_goes_away() {
        let (inbound_tx, inbound) = frame_channel(TrackKind::Video, 8);
        let (outbound, outbound_rx) = frame_channel(TrackKind::Video, 8);
        drop(outbound_rx);
        let track = ProcessedTrack::new(Box::new(inbound), Arc::new(Passthrough));

        inbound_tx.send(&video(1, b"a")).await.unwrap();
        let report = pump(track, Arc::new(outbound)).await;
        assert_eq!(report.forwarded, 0);
        assert!(matches!(report.error, Some(PipelineError::Sink(_))));
    }
}

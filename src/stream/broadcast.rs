//! The capture → process → publish cycle.
//!
//! Capture and processing are blocking, CPU-heavy work, so each cycle runs
//! them on tokio's blocking pool and awaits the result. The async side
//! (accepting clients, sending payloads, sleeping) keeps running meanwhile.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::capture::FrameSource;
use crate::config::{Pacing, StreamConfig};
use crate::error::{CaptureLostError, CaptureUnavailableError, DetectionError, StreamError};
use crate::faces::pipeline::system_millis;
use crate::faces::{FramePayload, FramePipeline};

use super::fanout::Fanout;
use super::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Streaming,
    Terminal,
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub frames_published: u64,
    pub misses: u64,
    pub detection_failures: u64,
}

enum CycleOutcome {
    SourceLost(CaptureLostError),
    Missed,
    DetectionFailed(DetectionError),
    Processed(FramePayload),
}

/// Everything a cycle needs on the blocking side. Moved into the worker and
/// handed back each cycle.
struct FrameCycle {
    source: Box<dyn FrameSource>,
    pipeline: FramePipeline,
}

impl FrameCycle {
    fn step(&mut self) -> CycleOutcome {
        let frame = match self.source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return CycleOutcome::Missed,
            Err(e) => return CycleOutcome::SourceLost(e),
        };

        match self.pipeline.process(&frame, system_millis()) {
            Ok(payload) => CycleOutcome::Processed(payload),
            Err(e) => CycleOutcome::DetectionFailed(e),
        }
    }
}

pub struct BroadcastLoop {
    registry: Arc<ConnectionRegistry>,
    fanout: Fanout,
    cycle: Duration,
    pacing: Pacing,
    miss_backoff: Duration,
    state: LoopState,
}

impl BroadcastLoop {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &StreamConfig) -> Self {
        Self {
            registry,
            fanout: Fanout::new(config.send_timeout_ms.map(Duration::from_millis)),
            cycle: Duration::from_millis(config.cycle_ms),
            pacing: config.pacing,
            miss_backoff: Duration::from_millis(config.miss_backoff_ms),
            state: LoopState::Init,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Open the source and stream until `shutdown` turns true.
    ///
    /// Failing to open the source, or losing it later, is fatal and is not
    /// retried. Missed frames and detector failures are logged and the cycle
    /// starts over.
    pub async fn run<F>(
        &mut self,
        open_source: F,
        pipeline: FramePipeline,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<LoopSummary, StreamError>
    where
        F: FnOnce() -> Result<Box<dyn FrameSource>, CaptureUnavailableError> + Send + 'static,
    {
        self.state = LoopState::Init;

        let source = match tokio::task::spawn_blocking(open_source).await {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                self.state = LoopState::Terminal;
                tracing::error!(error = %e, "Failed to open video source");
                return Err(e.into());
            }
            Err(e) => {
                self.state = LoopState::Terminal;
                return Err(e.into());
            }
        };

        tracing::info!(source = %source.describe(), "Video source opened");
        self.state = LoopState::Streaming;

        let mut cycle = FrameCycle { source, pipeline };
        let mut summary = LoopSummary::default();
        let mut ticker = tokio::time::interval(self.cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            if self.pacing == Pacing::Deadline {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break Ok(()),
                }
            }

            let worker = tokio::task::spawn_blocking(move || {
                let outcome = cycle.step();
                (cycle, outcome)
            });
            let outcome = match worker.await {
                Ok((returned, outcome)) => {
                    cycle = returned;
                    outcome
                }
                Err(e) => break Err(StreamError::from(e)),
            };

            match outcome {
                CycleOutcome::SourceLost(e) => {
                    tracing::error!(error = %e, "Video source lost");
                    break Err(StreamError::from(e));
                }
                CycleOutcome::Processed(payload) => {
                    let subscribers = self.registry.snapshot();
                    if !subscribers.is_empty() {
                        tracing::debug!(clients = subscribers.len(), faces = payload.faces.len(), "Broadcasting");
                    }
                    self.fanout.publish(&payload, &subscribers).await;
                    summary.frames_published += 1;
                }
                CycleOutcome::Missed => {
                    summary.misses += 1;
                    tracing::warn!("Frame read failed");
                    if !self.pause_after_miss(&mut shutdown).await {
                        break Ok(());
                    }
                    continue;
                }
                CycleOutcome::DetectionFailed(e) => {
                    summary.detection_failures += 1;
                    tracing::warn!(error = %e, "Detection failed, dropping frame");
                    if !self.pause_after_miss(&mut shutdown).await {
                        break Ok(());
                    }
                    continue;
                }
            }

            if self.pacing == Pacing::FixedSleep {
                tokio::select! {
                    _ = tokio::time::sleep(self.cycle) => {}
                    _ = shutdown.changed() => break Ok(()),
                }
            }
        };

        self.state = LoopState::Terminal;
        tracing::info!(
            published = summary.frames_published,
            misses = summary.misses,
            detection_failures = summary.detection_failures,
            "Broadcast loop stopped"
        );
        result.map(|()| summary)
    }

    /// Back off (or just yield) after a miss. Returns false if shutdown arrived.
    async fn pause_after_miss(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if self.miss_backoff.is_zero() {
            tokio::task::yield_now().await;
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.miss_backoff) => true,
            _ = shutdown.changed() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, PixelFormat};
    use crate::error::{ClassifierError, EmbeddingError};
    use crate::faces::{Classifier, Embedder, FaceBox, FaceDetector, Gallery, GalleryEntry, SimilarityMatcher};
    use crate::stream::testing::{addr, RecordingSink};
    use crate::stream::SubscriberHandle;
    use image::RgbImage;

    /// Gives `frames` frames, then misses. With `ends` set it reports the
    /// source lost instead of missing.
    struct FiniteSource {
        frames: usize,
        ends: bool,
    }

    impl FiniteSource {
        fn boxed(frames: usize) -> Box<dyn FrameSource> {
            Box::new(Self { frames, ends: false })
        }
    }

    impl FrameSource for FiniteSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureLostError> {
            if self.frames == 0 {
                if self.ends {
                    return Err(CaptureLostError::new("finite", "end of stream"));
                }
                return Ok(None);
            }
            self.frames -= 1;
            Ok(Frame::new(vec![0u8; 8 * 8 * 3], 8, 8, PixelFormat::Bgr))
        }

        fn describe(&self) -> String {
            "finite".to_string()
        }
    }

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceBox>, DetectionError> {
            Ok(vec![FaceBox { x1: 1, y1: 1, x2: 7, y2: 7, score: 0.9 }])
        }
    }

    struct ConstantEmbedder;

    impl Embedder for ConstantEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct FirstClass;

    impl Classifier for FirstClass {
        fn predict(&self, _embedding: &[f32]) -> Result<usize, ClassifierError> {
            Ok(0)
        }
    }

    fn pipeline() -> FramePipeline {
        let gallery = Gallery::from_entries(vec![GalleryEntry {
            embedding: vec![1.0, 0.0],
            label: "alice".into(),
        }])
        .unwrap();
        let matcher = SimilarityMatcher::new(gallery, Box::new(FirstClass), 0.6, "Visitor");
        FramePipeline::new(Box::new(OneFace), Box::new(ConstantEmbedder), matcher)
    }

    fn config() -> StreamConfig {
        StreamConfig {
            cycle_ms: 1,
            miss_backoff_ms: 1,
            ..StreamConfig::default()
        }
    }

    #[tokio::test]
    async fn test_streams_frames_to_subscribers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = RecordingSink::new();
        registry.register(SubscriberHandle::new(addr(1), sink.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut broadcast = BroadcastLoop::new(registry, &config());
        assert_eq!(broadcast.state(), LoopState::Init);

        let task = tokio::spawn(async move {
            let summary = broadcast
                .run(|| Ok(FiniteSource::boxed(3)), pipeline(), shutdown_rx)
                .await;
            (broadcast.state(), summary)
        });

        for _ in 0..500 {
            if sink.messages().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();

        let (state, summary) = task.await.unwrap();
        let summary = summary.unwrap();
        assert_eq!(state, LoopState::Terminal);
        assert_eq!(summary.frames_published, 3);

        let messages = sink.messages();
        assert_eq!(messages.len(), 3);
        let first: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(first["faces"][0]["name"], "alice");
        assert_eq!(first["faces"][0]["box"], serde_json::json!([1, 1, 6, 6]));
    }

    #[tokio::test]
    async fn test_misses_do_not_end_the_loop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut broadcast = BroadcastLoop::new(registry, &config());

        let task = tokio::spawn(async move {
            broadcast
                .run(|| Ok(FiniteSource::boxed(0)), pipeline(), shutdown_rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.frames_published, 0);
        assert!(summary.misses > 0);
    }

    #[tokio::test]
    async fn test_unavailable_source_is_fatal() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut broadcast = BroadcastLoop::new(registry, &config());

        let result = broadcast
            .run(|| Err(CaptureUnavailableError::new("0", "no such device")), pipeline(), shutdown_rx)
            .await;

        assert!(matches!(result, Err(StreamError::CaptureUnavailable(_))));
        assert_eq!(broadcast.state(), LoopState::Terminal);
    }

    #[tokio::test]
    async fn test_lost_source_ends_the_loop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = RecordingSink::new();
        registry.register(SubscriberHandle::new(addr(1), sink.clone()));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut broadcast = BroadcastLoop::new(registry, &config());

        let result = broadcast
            .run(
                || Ok(Box::new(FiniteSource { frames: 2, ends: true }) as Box<dyn FrameSource>),
                pipeline(),
                shutdown_rx,
            )
            .await;

        assert!(matches!(result, Err(StreamError::CaptureLost(_))));
        assert_eq!(broadcast.state(), LoopState::Terminal);
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_pacing_streams() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sink = RecordingSink::new();
        registry.register(SubscriberHandle::new(addr(1), sink.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = StreamConfig {
            pacing: Pacing::Deadline,
            ..config()
        };
        let mut broadcast = BroadcastLoop::new(registry, &config);

        let task = tokio::spawn(async move {
            broadcast
                .run(|| Ok(FiniteSource::boxed(2)), pipeline(), shutdown_rx)
                .await
        });

        for _ in 0..500 {
            if sink.messages().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();

        assert_eq!(task.await.unwrap().unwrap().frames_published, 2);
    }
}

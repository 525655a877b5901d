//! Per-frame processing: detect, crop, embed, match, assemble the payload.
//!
//! Every face is handled independently. A face that cannot be cropped,
//! embedded, or classified is logged and left out; the rest of the frame
//! still goes out.

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::capture::Frame;
use crate::error::{ClassifierError, DetectionError, EmbeddingError};

use super::detector::{FaceBox, FaceDetector};
use super::embedder::{Embedder, FACE_SIZE};
use super::matcher::SimilarityMatcher;
use super::payload::{DetectedFace, FramePayload};

/// Wall-clock source in milliseconds since the epoch.
pub type Clock = fn() -> i64;

pub fn system_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Why a single face was left out of the payload.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("empty crop")]
    EmptyCrop,

    #[error("embedding failed: {0}")]
    Embedding(EmbeddingError),

    #[error("classification failed: {0}")]
    Classifier(ClassifierError),
}

/// Result of one face's trip through the stages.
#[derive(Debug)]
pub enum FaceOutcome {
    Emitted(DetectedFace),
    Skipped(SkipReason),
}

pub struct FramePipeline {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn Embedder>,
    matcher: SimilarityMatcher,
    clock: Clock,
}

impl FramePipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn Embedder>,
        matcher: SimilarityMatcher,
    ) -> Self {
        Self {
            detector,
            embedder,
            matcher,
            clock: system_millis,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Process one frame. Face timestamps are `now_millis`; the payload's
    /// `lastUpdated` is read from the clock once all faces are done.
    ///
    /// Only a detector failure fails the frame.
    pub fn process(&mut self, frame: &Frame, now_millis: i64) -> Result<FramePayload, DetectionError> {
        let rgb = frame.to_rgb();
        let boxes = self.detector.detect(&rgb)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for face_box in boxes {
            let id = faces.len();
            match self.process_face(&rgb, &face_box, id, now_millis) {
                FaceOutcome::Emitted(face) => faces.push(face),
                FaceOutcome::Skipped(reason) => {
                    tracing::warn!(
                        bbox = ?face_box.to_xywh(),
                        reason = %reason,
                        "Skipping face"
                    );
                }
            }
        }

        Ok(FramePayload::new(faces, (self.clock)()))
    }

    fn process_face(&mut self, rgb: &RgbImage, face_box: &FaceBox, id: usize, now_millis: i64) -> FaceOutcome {
        let crop = match crop_face(rgb, face_box) {
            Some(crop) => crop,
            None => return FaceOutcome::Skipped(SkipReason::EmptyCrop),
        };

        let embedding = match self.embedder.embed(&crop) {
            Ok(embedding) => embedding,
            Err(e) => return FaceOutcome::Skipped(SkipReason::Embedding(e)),
        };

        let outcome = match self.matcher.match_embedding(&embedding) {
            Ok(outcome) => outcome,
            Err(e) => return FaceOutcome::Skipped(SkipReason::Classifier(e)),
        };

        FaceOutcome::Emitted(DetectedFace {
            id: id.to_string(),
            name: outcome.label,
            confidence: outcome.score,
            bbox: face_box.to_xywh(),
            timestamp: now_millis,
        })
    }
}

/// Clip the box to the image and resize the region to the embedder's input
/// size. `None` when nothing of the box lies inside the image.
pub fn crop_face(rgb: &RgbImage, face_box: &FaceBox) -> Option<RgbImage> {
    let (width, height) = rgb.dimensions();
    let x1 = face_box.x1.clamp(0, width as i32) as u32;
    let y1 = face_box.y1.clamp(0, height as i32) as u32;
    let x2 = face_box.x2.clamp(0, width as i32) as u32;
    let y2 = face_box.y2.clamp(0, height as i32) as u32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let region = imageops::crop_imm(rgb, x1, y1, x2 - x1, y2 - y1).to_image();
    Some(imageops::resize(&region, FACE_SIZE, FACE_SIZE, FilterType::Triangle))
}

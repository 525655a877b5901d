use anyhow::{anyhow, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

use crate::error::DetectionError;

/// Where the UltraFace weights are fetched from when missing locally.
pub const ULTRAFACE_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

/// Face box in pixel coordinates of the frame it was found in. Corners may
/// lie outside the frame; callers clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub score: f32,
}

impl FaceBox {
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// `[x, y, width, height]`
    pub fn to_xywh(&self) -> [i32; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }
}

/// Finds faces in a frame. Stateful implementations are allowed, hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectionError>;
}

/// Download a model file if it doesn't exist
pub fn ensure_model(path: &Path, url: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(model = ?path, "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    // Write beside the target first so an interrupted download is not mistaken for a model.
    let partial = path.with_extension("part");
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&partial, path)?;
    tracing::info!(model = ?path, "Model downloaded");

    Ok(())
}

/// UltraFace RFB-320: small and fast, good enough for frontal webcam faces.
pub struct UltraFaceDetector {
    session: Session,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl UltraFaceDetector {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;

    pub fn new(
        model_path: &Path,
        confidence_threshold: f32,
        nms_threshold: f32,
        intra_threads: usize,
    ) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(model = ?model_path, "Face detector loaded");

        Ok(Self {
            session,
            confidence_threshold,
            nms_threshold,
        })
    }

    fn run(&mut self, img: &RgbImage) -> Result<Vec<FaceBox>> {
        let (orig_width, orig_height) = img.dimensions();
        let (w, h) = (Self::INPUT_WIDTH as usize, Self::INPUT_HEIGHT as usize);

        let resized = image::imageops::resize(
            img,
            Self::INPUT_WIDTH,
            Self::INPUT_HEIGHT,
            image::imageops::FilterType::Triangle,
        );

        // NCHW, normalized to roughly [-1, 1]
        let mut input_data = vec![0.0f32; 3 * h * w];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let idx = y as usize * w + x as usize;
            for c in 0..3 {
                input_data[c * h * w + idx] = (pixel[c] as f32 - 127.0) / 128.0;
            }
        }

        let input_tensor = Tensor::from_array(([1usize, 3, h, w], input_data.into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["input" => input_tensor])?;

        let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
        let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

        let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
        let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

        let num_anchors = match scores_shape.get(1) {
            Some(&n) if n >= 0 => n as usize,
            _ => return Err(anyhow!("Unexpected scores shape {:?}", scores_shape)),
        };
        let candidates = decode_anchors(
            num_anchors,
            scores_data,
            boxes_data,
            (orig_width, orig_height),
            self.confidence_threshold,
        )?;

        Ok(nms(candidates, self.nms_threshold))
    }
}

impl FaceDetector for UltraFaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectionError> {
        Ok(self.run(image)?)
    }
}

/// Turn raw UltraFace outputs into pixel boxes above `confidence_threshold`.
///
/// `scores` is `[anchors, 2]` (background, face) and `boxes` is
/// `[anchors, 4]` (x1, y1, x2, y2 normalized), both flattened.
fn decode_anchors(
    num_anchors: usize,
    scores: &[f32],
    boxes: &[f32],
    (width, height): (u32, u32),
    confidence_threshold: f32,
) -> Result<Vec<FaceBox>> {
    if scores.len() < num_anchors * 2 || boxes.len() < num_anchors * 4 {
        return Err(anyhow!(
            "Detector output too short for {} anchors: {} scores, {} box values",
            num_anchors,
            scores.len(),
            boxes.len()
        ));
    }

    let mut candidates = Vec::new();
    for (score_pair, corners) in scores.chunks_exact(2).zip(boxes.chunks_exact(4)).take(num_anchors) {
        let score = score_pair[1];
        if score <= confidence_threshold {
            continue;
        }

        candidates.push(FaceBox {
            x1: (corners[0] * width as f32) as i32,
            y1: (corners[1] * height as f32) as i32,
            x2: (corners[2] * width as f32) as i32,
            y2: (corners[3] * height as f32) as i32,
            score,
        });
    }
    Ok(candidates)
}

/// Non-maximum suppression; survivors come out highest score first.
fn nms(mut boxes: Vec<FaceBox>, threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width().max(0) * a.height().max(0)) as f32;
    let area_b = (b.width().max(0) * b.height().max(0)) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: i32, y1: i32, x2: i32, y2: i32, score: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou() {
        let a = face(0, 0, 10, 10, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 0.001);

        let b = face(20, 20, 30, 30, 1.0);
        assert!(iou(&a, &b).abs() < 0.001);

        let c = face(5, 0, 15, 10, 1.0);
        assert!((iou(&a, &c) - 50.0 / 150.0).abs() < 0.001);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = vec![
            face(0, 0, 10, 10, 0.8),
            face(1, 1, 11, 11, 0.95),
            face(50, 50, 60, 60, 0.75),
        ];
        let kept = nms(boxes, 0.3);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.95);
        assert_eq!(kept[1].x1, 50);
    }

    #[test]
    fn test_decode_anchors_scales_to_frame() {
        let scores = [0.9, 0.1, 0.2, 0.8];
        let boxes = [0.0, 0.0, 1.0, 1.0, 0.25, 0.5, 0.75, 1.0];
        let faces = decode_anchors(2, &scores, &boxes, (200, 100), 0.7).unwrap();

        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].to_xywh(), [50, 50, 100, 50]);
        assert_eq!(faces[0].score, 0.8);
    }

    #[test]
    fn test_decode_anchors_rejects_short_output() {
        let scores = [0.1, 0.9, 0.1, 0.9];
        let boxes = [0.0, 0.0, 1.0, 1.0];
        assert!(decode_anchors(2, &scores, &boxes, (200, 100), 0.7).is_err());
        assert!(decode_anchors(3, &scores, &[0.0; 12], (200, 100), 0.7).is_err());
    }

    #[test]
    fn test_xywh() {
        assert_eq!(face(10, 20, 40, 60, 0.9).to_xywh(), [10, 20, 30, 40]);
    }

    #[test]
    fn test_ensure_model_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"weights").unwrap();

        // URL is never contacted because the file exists.
        ensure_model(&path, "http://invalid.invalid/model.onnx").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");
    }
}

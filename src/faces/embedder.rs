use anyhow::{anyhow, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

use crate::error::EmbeddingError;

/// Side length of the square RGB crop the embedder accepts.
pub const FACE_SIZE: u32 = 160;

/// Maps a `FACE_SIZE` x `FACE_SIZE` RGB face crop to a fixed-length vector.
pub trait Embedder: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbeddingError>;
}

/// Reject crops that are not the square size the model was trained on.
pub fn check_face_size(face: &RgbImage) -> Result<(), EmbeddingError> {
    let (width, height) = face.dimensions();
    if width != FACE_SIZE || height != FACE_SIZE {
        return Err(EmbeddingError::InvalidInput {
            width,
            height,
            expected: FACE_SIZE,
        });
    }
    Ok(())
}

/// FaceNet (Inception-ResNet v1) exported to ONNX with an NHWC input.
pub struct FaceNetEmbedder {
    session: Session,
}

impl FaceNetEmbedder {
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(model = ?model_path, "Face embedder loaded");

        Ok(Self { session })
    }

    fn run(&mut self, face: &RgbImage) -> Result<Vec<f32>> {
        let size = FACE_SIZE as usize;
        let input_data = standardize(face);

        let input_tensor =
            Tensor::from_array(([1usize, size, size, 3], input_data.into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs![input_tensor])?;

        let (_name, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, data) = output.try_extract_tensor::<f32>()?;

        let mut embedding = data.to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl Embedder for FaceNetEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, EmbeddingError> {
        check_face_size(face)?;
        let embedding = self.run(face)?;
        if embedding.is_empty() {
            return Err(EmbeddingError::EmptyOutput);
        }
        Ok(embedding)
    }
}

/// Per-image standardization: zero mean, unit variance over all channels,
/// with the deviation floored at `1/sqrt(n)` so flat crops don't blow up.
fn standardize(face: &RgbImage) -> Vec<f32> {
    let values: Vec<f32> = face.as_raw().iter().map(|&v| v as f32).collect();
    let n = values.len().max(1) as f32;

    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = variance.sqrt().max(1.0 / n.sqrt());

    values.into_iter().map(|v| (v - mean) / std).collect()
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

pub mod classifier;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod matcher;
pub mod payload;
pub mod pipeline;

pub use classifier::{Classifier, LinearClassifier};
pub use detector::{FaceBox, FaceDetector, UltraFaceDetector};
pub use embedder::{Embedder, FaceNetEmbedder};
pub use gallery::{load_gallery, Gallery, GalleryEntry};
pub use matcher::{MatchOutcome, SimilarityMatcher};
pub use payload::{DetectedFace, DetectionStatus, FramePayload};
pub use pipeline::FramePipeline;

use anyhow::{bail, Context, Result};

use crate::config::Config;

/// Load every model the pipeline needs. Any failure here is fatal to startup.
pub fn load_pipeline(config: &Config) -> Result<FramePipeline> {
    let models = &config.models;

    if models.download_detector {
        detector::ensure_model(&models.detector, detector::ULTRAFACE_URL)
            .context("Failed to fetch face detection model")?;
    }
    let detector = UltraFaceDetector::new(
        &models.detector,
        models.detector_confidence,
        models.nms_threshold,
        models.intra_threads,
    )
    .with_context(|| format!("Failed to load face detector {:?}", models.detector))?;

    let embedder = FaceNetEmbedder::new(&models.embedder, models.intra_threads)
        .with_context(|| format!("Failed to load face embedder {:?}", models.embedder))?;

    let gallery = load_gallery(&models.gallery)?;
    let classifier = LinearClassifier::load(&models.classifier)?;
    check_compatible(&gallery, &classifier)?;

    let matcher = SimilarityMatcher::new(
        gallery,
        Box::new(classifier),
        config.matching.threshold,
        config.matching.visitor_label.clone(),
    );

    Ok(FramePipeline::new(Box::new(detector), Box::new(embedder), matcher))
}

/// The classifier must speak the gallery's embedding space and identity numbering.
fn check_compatible(gallery: &Gallery, classifier: &LinearClassifier) -> Result<()> {
    if classifier.dimension() != gallery.dimension() {
        bail!(
            "Classifier expects {}-dim embeddings but gallery holds {}-dim embeddings",
            classifier.dimension(),
            gallery.dimension()
        );
    }
    if classifier.class_count() != gallery.identity_count() {
        bail!(
            "Classifier has {} classes but gallery has {} identities",
            classifier.class_count(),
            gallery.identity_count()
        );
    }
    Ok(())
}

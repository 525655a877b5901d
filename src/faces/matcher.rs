use ndarray::{Array1, ArrayView1, Zip};

use crate::error::{ClassifierError, MatchComputationError};

use super::classifier::Classifier;
use super::gallery::Gallery;

/// Label and best cosine similarity for one probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub label: String,
    pub score: f32,
}

/// Cosine similarity between `probe` and every gallery row.
///
/// Scores are clamped to `[-1, 1]` against rounding. Gallery rows with zero
/// norm score 0. A zero-norm probe, a dimension mismatch, or a non-finite
/// result is an error.
pub fn cosine_similarities(
    probe: &[f32],
    gallery: &Gallery,
) -> Result<Array1<f32>, MatchComputationError> {
    if probe.len() != gallery.dimension() {
        return Err(MatchComputationError::DimensionMismatch {
            probe: probe.len(),
            gallery: gallery.dimension(),
        });
    }

    let probe = ArrayView1::from(probe);
    let probe_norm = probe.dot(&probe).sqrt();
    if !probe_norm.is_finite() {
        return Err(MatchComputationError::NonFinite);
    }
    if probe_norm == 0.0 {
        return Err(MatchComputationError::ZeroNorm);
    }

    let dots = gallery.matrix().dot(&probe);
    let mut scores = Array1::zeros(dots.len());
    Zip::from(&mut scores)
        .and(&dots)
        .and(gallery.norms())
        .for_each(|score, &dot, &norm| {
            if norm > 0.0 {
                *score = (dot / (probe_norm * norm)).clamp(-1.0, 1.0);
            }
        });

    if scores.iter().any(|s| !s.is_finite()) {
        return Err(MatchComputationError::NonFinite);
    }
    Ok(scores)
}

/// Decides who a face is: best cosine similarity against the gallery, then
/// the classifier names the identity if that similarity clears the threshold.
pub struct SimilarityMatcher {
    gallery: Gallery,
    classifier: Box<dyn Classifier>,
    threshold: f32,
    visitor_label: String,
}

impl SimilarityMatcher {
    pub fn new(
        gallery: Gallery,
        classifier: Box<dyn Classifier>,
        threshold: f32,
        visitor_label: impl Into<String>,
    ) -> Self {
        Self {
            gallery,
            classifier,
            threshold,
            visitor_label: visitor_label.into(),
        }
    }

    /// Similarities against the gallery, all zero when they cannot be computed.
    pub fn similarities(&self, probe: &[f32]) -> Array1<f32> {
        cosine_similarities(probe, &self.gallery).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Similarity computation failed, scoring as zero");
            Array1::zeros(self.gallery.len())
        })
    }

    /// Resolve a probe to a label and its best similarity.
    ///
    /// The score is always the best cosine similarity, never the
    /// classifier's own confidence. Only a classifier failure is an error.
    pub fn match_embedding(&self, probe: &[f32]) -> Result<MatchOutcome, ClassifierError> {
        let scores = self.similarities(probe);
        let best = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let score = if best.is_finite() { best } else { 0.0 };

        if score > self.threshold {
            let class = self.classifier.predict(probe)?;
            let label = self
                .gallery
                .label_for_index(class)
                .ok_or(ClassifierError::UnknownClass(class))?;
            Ok(MatchOutcome {
                label: label.to_string(),
                score,
            })
        } else {
            Ok(MatchOutcome {
                label: self.visitor_label.clone(),
                score,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::gallery::GalleryEntry;

    /// Always answers the same class, regardless of input.
    struct FixedClassifier(usize);

    impl Classifier for FixedClassifier {
        fn predict(&self, _embedding: &[f32]) -> Result<usize, ClassifierError> {
            Ok(self.0)
        }
    }

    fn gallery() -> Gallery {
        Gallery::from_entries(vec![
            GalleryEntry { embedding: vec![1.0, 0.0, 0.0], label: "alice".into() },
            GalleryEntry { embedding: vec![0.0, 1.0, 0.0], label: "bob".into() },
            GalleryEntry { embedding: vec![0.0, 0.9, -0.1], label: "bob".into() },
        ])
        .unwrap()
    }

    fn matcher(class: usize) -> SimilarityMatcher {
        SimilarityMatcher::new(gallery(), Box::new(FixedClassifier(class)), 0.6, "Visitor")
    }

    /// Unit vector whose cosine with the x axis is `cos`, lying in the x/z plane.
    fn probe_with_similarity(cos: f32) -> Vec<f32> {
        vec![cos, 0.0, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_cosine_similarities() {
        let scores = cosine_similarities(&[2.0, 0.0, 0.0], &gallery()).unwrap();
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!(scores[1].abs() < 1e-6);

        let scores = cosine_similarities(&[-1.0, 0.0, 0.0], &gallery()).unwrap();
        assert!((scores[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_gallery_row_scores_zero() {
        let gallery = Gallery::from_entries(vec![
            GalleryEntry { embedding: vec![0.0, 0.0], label: "blank".into() },
            GalleryEntry { embedding: vec![1.0, 0.0], label: "x".into() },
        ])
        .unwrap();
        let scores = cosine_similarities(&[1.0, 0.0], &gallery).unwrap();
        assert_eq!(scores[0], 0.0);
        assert!((scores[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_probes_are_errors() {
        assert_eq!(
            cosine_similarities(&[0.0, 0.0, 0.0], &gallery()),
            Err(MatchComputationError::ZeroNorm)
        );
        assert_eq!(
            cosine_similarities(&[1.0, 0.0], &gallery()),
            Err(MatchComputationError::DimensionMismatch { probe: 2, gallery: 3 })
        );
        assert_eq!(
            cosine_similarities(&[f32::NAN, 0.0, 0.0], &gallery()),
            Err(MatchComputationError::NonFinite)
        );
    }

    #[test]
    fn test_below_threshold_is_visitor_with_best_score() {
        for cos in [0.59, 0.45, 0.3, 0.0, -0.4] {
            let outcome = matcher(0).match_embedding(&probe_with_similarity(cos)).unwrap();
            assert_eq!(outcome.label, "Visitor");
            assert!((outcome.score - cos.max(0.0)).abs() < 1e-5, "cos {}", cos);
        }
    }

    #[test]
    fn test_score_equal_to_threshold_is_visitor() {
        let gallery = Gallery::from_entries(vec![GalleryEntry {
            embedding: vec![1.0, 0.0],
            label: "alice".into(),
        }])
        .unwrap();
        let matcher = SimilarityMatcher::new(gallery, Box::new(FixedClassifier(0)), 0.6, "Visitor");

        // 3/5 is computed exactly, so the score equals the threshold
        let outcome = matcher.match_embedding(&[3.0, 4.0]).unwrap();
        assert_eq!(outcome.score, 0.6);
        assert_eq!(outcome.label, "Visitor");
    }

    #[test]
    fn test_self_similarity_never_exceeds_one() {
        // Awkward magnitudes so the dot product and norms round differently.
        let embeddings: Vec<Vec<f32>> = (1..200)
            .map(|seed| {
                (0..128)
                    .map(|i| (((seed * 7919 + i * 104_729) % 1000) as f32 - 500.0) / 37.0)
                    .collect()
            })
            .collect();

        for embedding in embeddings {
            let gallery = Gallery::from_entries(vec![GalleryEntry {
                embedding: embedding.clone(),
                label: "alice".into(),
            }])
            .unwrap();
            let scores = cosine_similarities(&embedding, &gallery).unwrap();
            assert!(scores[0] <= 1.0 && scores[0] > 0.999, "score {}", scores[0]);

            let negated: Vec<f32> = embedding.iter().map(|v| -v).collect();
            let scores = cosine_similarities(&negated, &gallery).unwrap();
            assert!(scores[0] >= -1.0 && scores[0] < -0.999, "score {}", scores[0]);
        }
    }

    #[test]
    fn test_above_threshold_uses_classifier_label() {
        // Classifier says "bob" (class 1) even though alice is the nearest row.
        let outcome = matcher(1).match_embedding(&probe_with_similarity(0.8)).unwrap();
        assert_eq!(outcome.label, "bob");
        assert!((outcome.score - 0.8).abs() < 1e-5);

        let outcome = matcher(0).match_embedding(&probe_with_similarity(0.95)).unwrap();
        assert_eq!(outcome.label, "alice");
        assert!((outcome.score - 0.95).abs() < 1e-5);
    }

    #[test]
    fn test_zero_probe_is_visitor_with_zero_confidence() {
        let outcome = matcher(0).match_embedding(&[0.0, 0.0, 0.0]).unwrap();
        assert_eq!(outcome.label, "Visitor");
        assert_eq!(outcome.score, 0.0);
        assert!(!outcome.score.is_nan());
    }

    #[test]
    fn test_unknown_class_is_an_error() {
        let result = matcher(7).match_embedding(&probe_with_similarity(0.9));
        assert!(matches!(result, Err(ClassifierError::UnknownClass(7))));
    }
}

//! Identity classifier consulted once a probe is close enough to the gallery.

use ndarray::{Array1, Array2, ArrayView1};
use serde::Deserialize;
use std::path::Path;

use crate::error::ClassifierError;

/// Maps an embedding to a class index in the gallery's identity numbering.
pub trait Classifier: Send + Sync {
    fn predict(&self, embedding: &[f32]) -> Result<usize, ClassifierError>;
}

#[derive(Deserialize)]
struct LinearClassifierFile {
    weights: Vec<Vec<f32>>,
    intercepts: Vec<f32>,
}

/// Linear decision functions, one per class (one-vs-rest), prediction by
/// argmax. A single row is a binary model: positive decision means class 1.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    weights: Array2<f32>,
    intercepts: Array1<f32>,
}

impl LinearClassifier {
    pub fn new(weights: Vec<Vec<f32>>, intercepts: Vec<f32>) -> Result<Self, ClassifierError> {
        if weights.is_empty() || weights.len() != intercepts.len() {
            return Err(ClassifierError::ShapeMismatch {
                weights: weights.len(),
                intercepts: intercepts.len(),
            });
        }

        let dim = weights[0].len();
        if let Some(row) = weights.iter().find(|row| row.len() != dim) {
            return Err(ClassifierError::DimensionMismatch {
                expected: dim,
                found: row.len(),
            });
        }

        let rows = weights.len();
        let flat: Vec<f32> = weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((rows, dim), flat).map_err(|_| {
            ClassifierError::ShapeMismatch {
                weights: rows,
                intercepts: rows,
            }
        })?;

        Ok(Self {
            weights,
            intercepts: Array1::from(intercepts),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let content = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: LinearClassifierFile =
            serde_json::from_str(&content).map_err(|source| ClassifierError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let classifier = Self::new(file.weights, file.intercepts)?;
        tracing::info!(path = ?path, classes = classifier.class_count(), "Classifier loaded");
        Ok(classifier)
    }

    /// Number of classes the model can predict.
    pub fn class_count(&self) -> usize {
        match self.weights.nrows() {
            1 => 2,
            n => n,
        }
    }

    pub fn dimension(&self) -> usize {
        self.weights.ncols()
    }
}

impl Classifier for LinearClassifier {
    fn predict(&self, embedding: &[f32]) -> Result<usize, ClassifierError> {
        if embedding.len() != self.dimension() {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.dimension(),
                found: embedding.len(),
            });
        }

        let decision = self.weights.dot(&ArrayView1::from(embedding)) + &self.intercepts;

        if decision.len() == 1 {
            return Ok(usize::from(decision[0] > 0.0));
        }

        let best = decision
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &score)| {
                if score > best.1 {
                    (i, score)
                } else {
                    best
                }
            });
        Ok(best.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiclass_argmax() {
        let classifier = LinearClassifier::new(
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, -1.0]],
            vec![0.0, 0.0, 0.5],
        )
        .unwrap();

        assert_eq!(classifier.class_count(), 3);
        assert_eq!(classifier.predict(&[0.9, 0.1]).unwrap(), 0);
        assert_eq!(classifier.predict(&[0.1, 0.9]).unwrap(), 1);
        assert_eq!(classifier.predict(&[-0.5, -0.5]).unwrap(), 2);
    }

    #[test]
    fn test_binary_decision() {
        let classifier = LinearClassifier::new(vec![vec![1.0, -1.0]], vec![0.0]).unwrap();

        assert_eq!(classifier.class_count(), 2);
        assert_eq!(classifier.predict(&[0.8, 0.2]).unwrap(), 1);
        assert_eq!(classifier.predict(&[0.2, 0.8]).unwrap(), 0);
    }

    #[test]
    fn test_shape_errors() {
        assert!(matches!(
            LinearClassifier::new(vec![vec![1.0]], vec![0.0, 1.0]),
            Err(ClassifierError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            LinearClassifier::new(vec![vec![1.0, 2.0], vec![1.0]], vec![0.0, 1.0]),
            Err(ClassifierError::DimensionMismatch { expected: 2, found: 1 })
        ));

        let classifier = LinearClassifier::new(vec![vec![1.0, 2.0]], vec![0.0]).unwrap();
        assert!(classifier.predict(&[1.0]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        std::fs::write(
            &path,
            r#"{"weights": [[1.0, 0.0], [0.0, 1.0]], "intercepts": [0.0, 0.1]}"#,
        )
        .unwrap();

        let classifier = LinearClassifier::load(&path).unwrap();
        assert_eq!(classifier.dimension(), 2);
        assert_eq!(classifier.predict(&[0.0, 0.0]).unwrap(), 1);
    }
}

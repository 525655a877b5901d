//! Known-face gallery: reference embeddings with their identity labels.
//!
//! The gallery file is JSON with two parallel arrays:
//!
//! ```json
//! { "embeddings": [[0.1, 0.2, ...], ...], "labels": ["alice", ...] }
//! ```
//!
//! An identity may appear on several rows. Class indices used by the
//! classifier are positions in the sorted list of distinct labels.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Deserialize;
use std::path::Path;

use crate::error::GalleryLoadError;

/// One reference embedding and the identity it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub embedding: Vec<f32>,
    pub label: String,
}

#[derive(Deserialize)]
struct GalleryFile {
    embeddings: Vec<Vec<f32>>,
    labels: Vec<String>,
}

/// Immutable gallery, stored as a row matrix for batched similarity.
#[derive(Debug, Clone)]
pub struct Gallery {
    embeddings: Array2<f32>,
    norms: Array1<f32>,
    labels: Vec<String>,
    classes: Vec<String>,
}

/// Read and validate a gallery file.
pub fn load_gallery(path: &Path) -> Result<Gallery, GalleryLoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| GalleryLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: GalleryFile =
        serde_json::from_str(&content).map_err(|source| GalleryLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if file.embeddings.len() != file.labels.len() {
        return Err(GalleryLoadError::CountMismatch {
            embeddings: file.embeddings.len(),
            labels: file.labels.len(),
        });
    }

    let entries = file
        .embeddings
        .into_iter()
        .zip(file.labels)
        .map(|(embedding, label)| GalleryEntry { embedding, label })
        .collect();

    let gallery = Gallery::from_entries(entries)?;
    tracing::info!(
        path = ?path,
        rows = gallery.len(),
        identities = gallery.identity_count(),
        "Gallery loaded"
    );
    Ok(gallery)
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Result<Self, GalleryLoadError> {
        let dim = match entries.first() {
            Some(first) if !first.embedding.is_empty() => first.embedding.len(),
            _ => return Err(GalleryLoadError::Empty),
        };

        let mut flat = Vec::with_capacity(entries.len() * dim);
        let mut labels = Vec::with_capacity(entries.len());
        for (row, entry) in entries.into_iter().enumerate() {
            if entry.embedding.len() != dim {
                return Err(GalleryLoadError::RaggedEmbedding {
                    row,
                    expected: dim,
                    found: entry.embedding.len(),
                });
            }
            flat.extend(entry.embedding);
            labels.push(entry.label);
        }

        let rows = labels.len();
        let embeddings = Array2::from_shape_vec((rows, dim), flat).map_err(|_| {
            GalleryLoadError::CountMismatch {
                embeddings: rows,
                labels: rows,
            }
        })?;
        let norms = embeddings.map_axis(Axis(1), |row| row.dot(&row).sqrt());

        let mut classes = labels.clone();
        classes.sort();
        classes.dedup();

        Ok(Self {
            embeddings,
            norms,
            labels,
            classes,
        })
    }

    /// Number of rows (embeddings).
    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn dimension(&self) -> usize {
        self.embeddings.ncols()
    }

    /// Number of distinct identities.
    pub fn identity_count(&self) -> usize {
        self.classes.len()
    }

    /// Class index of an identity, as the classifier numbers them.
    pub fn identity_index(&self, label: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }

    pub fn label_for_index(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn label_at_row(&self, row: usize) -> Option<&str> {
        self.labels.get(row).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = GalleryEntry> + '_ {
        self.embeddings
            .outer_iter()
            .zip(&self.labels)
            .map(|(row, label)| GalleryEntry {
                embedding: row.to_vec(),
                label: label.clone(),
            })
    }

    pub(crate) fn matrix(&self) -> &Array2<f32> {
        &self.embeddings
    }

    pub(crate) fn norms(&self) -> ArrayView1<'_, f32> {
        self.norms.view()
    }
}

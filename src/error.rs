//! Error types for the recognition and broadcast pipeline.
//!
//! The enums follow the failure tiers the service distinguishes:
//! fatal startup/capture failures, per-face failures that drop a single
//! face, per-cycle misses, and per-subscriber delivery failures.

use std::path::PathBuf;

use thiserror::Error;

/// The known-face gallery could not be loaded.
#[derive(Debug, Error)]
pub enum GalleryLoadError {
    #[error("gallery file {path:?} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("gallery file {path:?} is not valid gallery JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("gallery has {embeddings} embeddings but {labels} labels")]
    CountMismatch { embeddings: usize, labels: usize },

    #[error("gallery is empty")]
    Empty,

    #[error("gallery row {row} has dimension {found}, expected {expected}")]
    RaggedEmbedding {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Similarity between a probe and the gallery could not be computed.
#[derive(Debug, Error, PartialEq)]
pub enum MatchComputationError {
    #[error("probe has dimension {probe}, gallery has dimension {gallery}")]
    DimensionMismatch { probe: usize, gallery: usize },

    #[error("probe embedding has zero norm")]
    ZeroNorm,

    #[error("similarity is not finite")]
    NonFinite,
}

/// The secondary classifier failed to produce a class.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier file {path:?} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("classifier file {path:?} is not valid classifier JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("classifier has {weights} weight rows but {intercepts} intercepts")]
    ShapeMismatch { weights: usize, intercepts: usize },

    #[error("classifier expects dimension {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("classifier predicted class {0} which has no label")]
    UnknownClass(usize),
}

/// A face crop could not be turned into an embedding.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("face crop is {width}x{height}, expected {expected}x{expected}")]
    InvalidInput {
        width: u32,
        height: u32,
        expected: u32,
    },

    #[error("embedding model returned no output")]
    EmptyOutput,

    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

/// The detector failed on a whole frame.
#[derive(Debug, Error)]
#[error("face detection failed: {0}")]
pub struct DetectionError(#[from] pub anyhow::Error);

/// The capture device or stream could not be opened.
#[derive(Debug, Error)]
#[error("capture source {source_name:?} unavailable: {reason}")]
pub struct CaptureUnavailableError {
    pub source_name: String,
    pub reason: String,
}

impl CaptureUnavailableError {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// An open capture source stopped delivering for good (end of stream,
/// device removed).
#[derive(Debug, Error)]
#[error("capture source {source_name:?} lost: {reason}")]
pub struct CaptureLostError {
    pub source_name: String,
    pub reason: String,
}

impl CaptureLostError {
    pub fn new(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Sending one payload to one subscriber failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("send timed out after {0} ms")]
    Timeout(u64),
}

/// Fatal errors that end the broadcast loop.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    CaptureUnavailable(#[from] CaptureUnavailableError),

    #[error(transparent)]
    CaptureLost(#[from] CaptureLostError),

    #[error("frame worker stopped unexpectedly: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

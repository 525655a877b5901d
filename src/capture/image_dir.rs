use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{CaptureLostError, CaptureUnavailableError};

use super::{Frame, FrameSource};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Replays the still images of a directory as an endless frame sequence.
pub struct ImageDirSource {
    root: PathBuf,
    images: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub fn open(directory: &Path) -> Result<Self, CaptureUnavailableError> {
        let name = directory.to_string_lossy().into_owned();
        let images = discover_images(directory);

        if images.is_empty() {
            return Err(CaptureUnavailableError::new(name, "no images in directory"));
        }

        tracing::info!(dir = %name, count = images.len(), "Replaying still images");

        Ok(Self {
            root: directory.to_path_buf(),
            images,
            next: 0,
        })
    }
}

impl FrameSource for ImageDirSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureLostError> {
        let path = &self.images[self.next];
        self.next = (self.next + 1) % self.images.len();

        match image::open(path) {
            Ok(img) => Ok(Some(Frame::from_rgb(img.to_rgb8()))),
            Err(e) => {
                tracing::debug!(path = ?path, error = %e, "Failed to decode still");
                Ok(None)
            }
        }
    }

    fn describe(&self) -> String {
        format!("images:{}", self.root.display())
    }
}

fn discover_images(directory: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        IMAGE_EXTENSIONS.contains(&ext.as_str())
                    })
                    .unwrap_or(false)
        })
        .collect();

    images.sort();
    images
}

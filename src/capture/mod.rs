//! Frame acquisition from a camera, stream, or directory of stills.

pub mod ffmpeg;
pub mod image_dir;

use image::RgbImage;
use std::path::Path;

use crate::config::CaptureConfig;
use crate::error::{CaptureLostError, CaptureUnavailableError};

pub use ffmpeg::FfmpegSource;
pub use image_dir::ImageDirSource;

/// Channel order of a frame's packed 8-bit pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr,
    Rgb,
}

/// One captured frame: packed 3-channel pixels in row-major order.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    /// Returns `None` when `data` does not hold exactly `width * height * 3` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            format,
        })
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            format: PixelFormat::Rgb,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Convert to an RGB image, swapping channels if the frame is BGR.
    pub fn to_rgb(&self) -> RgbImage {
        let data = match self.format {
            PixelFormat::Rgb => self.data.clone(),
            PixelFormat::Bgr => {
                let mut data = self.data.clone();
                for px in data.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                data
            }
        };
        // Length is checked in the constructors.
        RgbImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

/// A source of frames. Opening happens in the constructor; a source that
/// exists has been opened successfully.
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` means no frame was available this
    /// time; an error means the source will never deliver again.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureLostError>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Open the configured capture source.
///
/// A directory is replayed as stills; anything else (device index, device
/// path, file, URL) is demuxed and decoded with libav.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureUnavailableError> {
    let path = Path::new(&config.source);
    if path.is_dir() {
        Ok(Box::new(ImageDirSource::open(path)?))
    } else {
        Ok(Box::new(FfmpegSource::open(config)?))
    }
}

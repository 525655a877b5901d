use ffmpeg_next::format::context::{Context as FormatContext, Input};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags};
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::{Dictionary, Packet};

use crate::config::CaptureConfig;
use crate::error::{CaptureLostError, CaptureUnavailableError};

use super::{Frame, FrameSource, PixelFormat};

/// Undecodable packets tolerated while waiting for the first frame.
const OPEN_ATTEMPTS: usize = 25;

/// Camera, video file or network stream, demuxed and decoded with libav and
/// scaled to BGR frames of a fixed size.
pub struct FfmpegSource {
    name: String,
    input: Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: Scaler,
    stream_index: usize,
    width: u32,
    height: u32,
    /// End of input was sent to the decoder; only buffered frames remain.
    draining: bool,
    /// First frame, decoded while opening to prove the source delivers.
    pending: Option<Frame>,
}

// Safety: a source is owned by one cycle worker at a time. The libav
// contexts inside it are never shared between threads.
unsafe impl Send for FfmpegSource {}

/// What cut a read short.
#[derive(Debug)]
enum ReadFailure {
    /// The demuxer hit the end of input or failed; nothing more will come.
    Ended(String),
    /// One packet or frame could not be decoded or converted.
    Corrupt(ffmpeg_next::Error),
}

impl FfmpegSource {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureUnavailableError> {
        let name = config.source.clone();
        if config.width == 0 || config.height == 0 {
            return Err(CaptureUnavailableError::new(name, "frame size must be non-zero"));
        }

        ffmpeg_next::init()
            .map_err(|e| CaptureUnavailableError::new(&name, format!("libav init failed: {}", e)))?;
        ffmpeg_next::device::register_all();

        let spec = input_spec(&config.source);
        let input = open_input(&spec)
            .map_err(|e| CaptureUnavailableError::new(&name, format!("cannot open input: {}", e)))?;

        let (stream_index, decoder) = {
            let stream = input
                .streams()
                .best(ffmpeg_next::media::Type::Video)
                .ok_or_else(|| CaptureUnavailableError::new(&name, "no video stream"))?;
            let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
                .and_then(|context| context.decoder().video())
                .map_err(|e| CaptureUnavailableError::new(&name, format!("no decoder: {}", e)))?;
            (stream.index(), decoder)
        };

        let scaler = Scaler::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::BGR24,
            config.width,
            config.height,
            Flags::BILINEAR,
        )
        .map_err(|e| CaptureUnavailableError::new(&name, format!("cannot scale frames: {}", e)))?;

        let mut source = Self {
            name,
            input,
            decoder,
            scaler,
            stream_index,
            width: config.width,
            height: config.height,
            draining: false,
            pending: None,
        };

        for _ in 0..OPEN_ATTEMPTS {
            match source.decode_next() {
                Ok(frame) => {
                    source.pending = Some(frame);
                    tracing::info!(
                        source = %source.name,
                        width = source.width,
                        height = source.height,
                        "Video input opened"
                    );
                    return Ok(source);
                }
                Err(ReadFailure::Corrupt(e)) => {
                    tracing::debug!(source = %source.name, error = %e, "Skipping undecodable packet");
                }
                Err(ReadFailure::Ended(reason)) => {
                    return Err(CaptureUnavailableError::new(
                        source.name.clone(),
                        format!("no frame before end of input: {}", reason),
                    ));
                }
            }
        }

        Err(CaptureUnavailableError::new(
            source.name.clone(),
            "no decodable frame at start of input",
        ))
    }

    /// Feed packets to the decoder until one frame comes out.
    fn decode_next(&mut self) -> Result<Frame, ReadFailure> {
        let mut decoded = Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map_err(ReadFailure::Corrupt);
            }
            if self.draining {
                return Err(ReadFailure::Ended("end of stream".to_string()));
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => {
                    let _ = self.decoder.send_eof();
                    self.draining = true;
                    continue;
                }
                Err(e) => return Err(ReadFailure::Ended(e.to_string())),
            }

            if packet.stream() != self.stream_index {
                continue;
            }
            self.decoder.send_packet(&packet).map_err(ReadFailure::Corrupt)?;
        }
    }

    fn convert(&mut self, decoded: &Video) -> Result<Frame, ffmpeg_next::Error> {
        let mut bgr = Video::empty();
        self.scaler.run(decoded, &mut bgr)?;

        packed_pixels(&bgr, self.width, self.height)
            .and_then(|pixels| Frame::new(pixels, self.width, self.height, PixelFormat::Bgr))
            .ok_or(ffmpeg_next::Error::InvalidData)
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureLostError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }

        match self.decode_next() {
            Ok(frame) => Ok(Some(frame)),
            Err(ReadFailure::Corrupt(e)) => {
                tracing::warn!(source = %self.name, error = %e, "Dropping undecodable frame");
                Ok(None)
            }
            Err(ReadFailure::Ended(reason)) => Err(CaptureLostError::new(self.name.clone(), reason)),
        }
    }

    fn describe(&self) -> String {
        format!("libav:{}", self.name)
    }
}

/// How libav should open a source string.
#[derive(Debug, PartialEq)]
struct InputSpec {
    /// Capture device demuxer to force; `None` lets libav probe.
    device: Option<&'static str>,
    url: String,
    options: Vec<(&'static str, String)>,
}

/// A bare number is a local camera index; anything else is a path or URL.
fn input_spec(source: &str) -> InputSpec {
    if let Ok(index) = source.parse::<u32>() {
        #[cfg(target_os = "linux")]
        return InputSpec {
            device: Some("v4l2"),
            url: format!("/dev/video{}", index),
            options: Vec::new(),
        };

        #[cfg(target_os = "macos")]
        return InputSpec {
            device: Some("avfoundation"),
            url: format!("{}:none", index),
            options: vec![("framerate", "30".to_string())],
        };

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        return InputSpec {
            device: Some("dshow"),
            url: format!("video={}", index),
            options: Vec::new(),
        };
    }

    let mut options = Vec::new();
    if source.starts_with("rtsp://") {
        options.push(("rtsp_transport", "tcp".to_string()));
    }
    InputSpec {
        device: None,
        url: source.to_string(),
        options,
    }
}

fn open_input(spec: &InputSpec) -> Result<Input, ffmpeg_next::Error> {
    let mut options = Dictionary::new();
    for (key, value) in &spec.options {
        options.set(key, value);
    }

    let Some(wanted) = spec.device else {
        return ffmpeg_next::format::input_with_dictionary(&spec.url, options);
    };

    // Device demuxers register under comma-separated aliases ("video4linux2,v4l2").
    let device = ffmpeg_next::device::input::video()
        .find(|format| format.name().split(',').any(|alias| alias == wanted))
        .ok_or(ffmpeg_next::Error::DemuxerNotFound)?;

    match ffmpeg_next::format::open_with(
        &spec.url,
        &ffmpeg_next::format::format::Format::Input(device),
        options,
    )? {
        FormatContext::Input(input) => Ok(input),
        FormatContext::Output(_) => Err(ffmpeg_next::Error::DemuxerNotFound),
    }
}

/// Copy a packed 3-channel frame into a tight buffer, dropping row padding.
fn packed_pixels(frame: &Video, width: u32, height: u32) -> Option<Vec<u8>> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(data.get(start..start + row_bytes)?);
    }
    Some(pixels)
}

//! One-shot frame capture from a network video stream.
//!
//! A capture opens the stream, reads a single frame, writes it to a fixed
//! path, encodes it as JPEG and hands back a base64 data URL. The stream
//! handle lives in a [`StreamGuard`], so it is released exactly once on every
//! exit path, panics included.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{codecs::jpeg::JpegEncoder, ImageError, RgbImage};
use opencv::{core::Mat, imgproc, prelude::*, videoio};
use std::{
    fmt,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Could not open video stream: {address}")]
    StreamUnreachable { address: String },
    #[error("Could not read frame from stream: {address}")]
    FrameUnavailable { address: String },
    #[error("Could not encode frame to JPEG: {0}")]
    EncodingFailed(String),
    #[error("Exception during frame capture/encoding: {0}")]
    UnexpectedFailure(String),
}

impl CaptureError {
    /// Stable label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::StreamUnreachable { .. } => "stream_unreachable",
            CaptureError::FrameUnavailable { .. } => "frame_unavailable",
            CaptureError::EncodingFailed(_) => "encoding_failed",
            CaptureError::UnexpectedFailure(_) => "unexpected_failure",
        }
    }
}

/// Failures reported by a [`StreamSource`] or [`StreamHandle`].
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to open stream: {0}")]
    Open(String),
    #[error("Failed to read frame: {0}")]
    Read(String),
}

impl From<opencv::Error> for StreamError {
    fn from(err: opencv::Error) -> Self {
        StreamError::Read(err.to_string())
    }
}

pub trait StreamSource: Send + Sync + 'static {
    type Handle: StreamHandle;

    fn open(&self, address: &str) -> Result<Self::Handle, StreamError>;
}

pub trait StreamHandle {
    /// `Ok(None)` means the stream is open but produced no frame.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, StreamError>;

    fn release(&mut self);
}

/// Owns a stream handle and releases it when dropped.
pub struct StreamGuard<H: StreamHandle> {
    handle: H,
}

impl<H: StreamHandle> StreamGuard<H> {
    pub fn new(handle: H) -> Self {
        Self { handle }
    }
}

impl<H: StreamHandle> Deref for StreamGuard<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H: StreamHandle> DerefMut for StreamGuard<H> {
    fn deref_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

impl<H: StreamHandle> Drop for StreamGuard<H> {
    fn drop(&mut self) {
        self.handle.release();
        tracing::info!("Video capture released");
    }
}

pub trait FrameEncoder: Send + Sync + 'static {
    fn media_type(&self) -> &'static str;

    fn encode(&self, frame: &RgbImage) -> Result<Vec<u8>, ImageError>;

    /// File extensions whose on-disk format matches [`Self::encode`].
    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }
}

#[derive(Debug, Clone)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn media_type(&self) -> &'static str {
        "image/jpeg"
    }

    fn encode(&self, frame: &RgbImage) -> Result<Vec<u8>, ImageError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality).encode_image(frame)?;
        Ok(buf)
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["jpg", "jpeg"]
    }
}

/// Media-type tagged, base64 encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: &'static str,
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(media_type: &'static str, bytes: &[u8]) -> Self {
        Self {
            media_type,
            data: BASE64.encode(bytes),
        }
    }

    pub fn to_data_url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.media_type, self.data)
    }
}

pub struct FrameCapturer<S: StreamSource, E: FrameEncoder> {
    source: S,
    encoder: E,
}

impl<S: StreamSource, E: FrameEncoder> FrameCapturer<S, E> {
    pub fn new(source: S, encoder: E) -> Self {
        Self { source, encoder }
    }

    /// Runs [`Self::capture_blocking`] on the blocking pool. A panic inside the
    /// capture comes back as [`CaptureError::UnexpectedFailure`].
    pub async fn capture(
        self: &Arc<Self>,
        address: String,
        image_path: PathBuf,
    ) -> Result<EncodedImage, CaptureError> {
        let capturer = self.clone();
        tokio::task::spawn_blocking(move || capturer.capture_blocking(&address, &image_path))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Capture task failed: {:?}", e);
                Err(CaptureError::UnexpectedFailure(e.to_string()))
            })
    }

    #[instrument(skip(self))]
    pub fn capture_blocking(
        &self,
        address: &str,
        image_path: &Path,
    ) -> Result<EncodedImage, CaptureError> {
        let handle = self.source.open(address).map_err(|e| {
            tracing::error!("Could not open video stream {}: {}", address, e);
            CaptureError::StreamUnreachable {
                address: address.to_string(),
            }
        })?;
        let mut stream = StreamGuard::new(handle);

        let frame = match stream.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::error!("Could not read frame from stream {}", address);
                return Err(CaptureError::FrameUnavailable {
                    address: address.to_string(),
                });
            }
            Err(e) => {
                tracing::error!("Frame read failed on {}: {}", address, e);
                return Err(CaptureError::UnexpectedFailure(e.to_string()));
            }
        };
        tracing::info!(
            "Successfully captured frame from stream with shape {}x{}",
            frame.width(),
            frame.height()
        );

        let encoded = self.encoder.encode(&frame);

        // Same bytes on disk as in the payload when the formats agree.
        let written = match &encoded {
            Ok(bytes) if self.matches_encoder(image_path) => {
                std::fs::write(image_path, bytes).map_err(|e| e.to_string())
            }
            _ => frame.save(image_path).map_err(|e| e.to_string()),
        };
        written.map_err(|e| {
            tracing::error!("Could not save frame to {}: {}", image_path.display(), e);
            CaptureError::UnexpectedFailure(format!(
                "failed to save frame to {}: {}",
                image_path.display(),
                e
            ))
        })?;

        let encoded = encoded.map_err(|e| {
            tracing::error!("Could not encode frame: {}", e);
            CaptureError::EncodingFailed(e.to_string())
        })?;

        Ok(EncodedImage::from_bytes(self.encoder.media_type(), &encoded))
    }

    fn matches_encoder(&self, image_path: &Path) -> bool {
        image_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.encoder
                    .extensions()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

/// Streams opened through OpenCV's `videoio` backends (RTSP, HTTP, files).
#[derive(Debug, Default, Clone)]
pub struct OpenCvSource;

impl StreamSource for OpenCvSource {
    type Handle = OpenCvStream;

    fn open(&self, address: &str) -> Result<OpenCvStream, StreamError> {
        let capture = videoio::VideoCapture::from_file(address, videoio::CAP_ANY)
            .map_err(|e| StreamError::Open(e.to_string()))?;
        let mut stream = OpenCvStream { capture };
        let opened = stream
            .capture
            .is_opened()
            .map_err(|e| StreamError::Open(e.to_string()))?;
        if !opened {
            stream.release();
            return Err(StreamError::Open("backend reported a closed stream".into()));
        }
        Ok(stream)
    }
}

pub struct OpenCvStream {
    capture: videoio::VideoCapture,
}

impl StreamHandle for OpenCvStream {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, StreamError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        bgr_mat_to_rgb(&frame).map(Some)
    }

    fn release(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release video capture: {}", e);
        }
    }
}

fn bgr_mat_to_rgb(frame: &Mat) -> Result<RgbImage, StreamError> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let size = rgb.size()?;
    let bytes = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(size.width as u32, size.height as u32, bytes)
        .ok_or_else(|| StreamError::Read("frame buffer does not match its dimensions".into()))
}

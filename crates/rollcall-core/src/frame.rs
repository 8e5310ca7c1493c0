//! Frame type, dark-frame detection and the frame source seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame source exhausted")]
    Exhausted,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured grayscale camera frame.
///
/// `data` may be empty when the frame is only a handle for a descriptor
/// source that already holds the image (e.g. a recorded session).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from grayscale pixels, classifying it as dark or not.
    pub fn from_gray(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&data, DARK_FRAME_RATIO);
        Ok(Self {
            data,
            width,
            height,
            timestamp: Utc::now(),
            sequence,
            is_dark,
        })
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// Check if a frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest
/// bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Anything that can hand out camera frames in temporal order.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame. `FrameError::Exhausted` means no more frames will ever come.
    async fn next_frame(&mut self) -> Result<Frame, FrameError>;
}

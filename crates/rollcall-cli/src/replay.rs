//! Recorded sessions: frames and their detections replayed from JSON.
//!
//! ```json
//! { "width": 8, "height": 8,
//!   "frames": [ { "faces": [ { "descriptor": [0.1, 0.2], "box": { "x": 10, "y": 12, "width": 40, "height": 40 } } ] },
//!               { "dark": true } ] }
//! ```

use async_trait::async_trait;
use rollcall_core::{DetectError, Detection, FaceDetector, Frame, FrameError, FrameSource};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LIT_PIXEL: u8 = 128;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid recording: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("recording has no frames")]
    NoFrames,
    #[error("frame size must be non-zero")]
    ZeroSize,
}

#[derive(Debug, Deserialize)]
pub struct RecordedFrame {
    #[serde(default)]
    pub faces: Vec<Detection>,
    #[serde(default)]
    pub dark: bool,
}

#[derive(Debug, Deserialize)]
pub struct Recording {
    #[serde(default = "default_side")]
    pub width: u32,
    #[serde(default = "default_side")]
    pub height: u32,
    pub frames: Vec<RecordedFrame>,
}

fn default_side() -> u32 {
    8
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ReplayError> {
        let recording: Self = serde_json::from_str(text)?;
        if recording.frames.is_empty() {
            return Err(ReplayError::NoFrames);
        }
        if recording.width == 0 || recording.height == 0 {
            return Err(ReplayError::ZeroSize);
        }
        Ok(recording)
    }

    /// Split into the camera half and the model half.
    ///
    /// Frame `i` carries sequence number `i`, which the detector uses to
    /// look up the faces recorded for it.
    pub fn split(self) -> (ReplayFrames, ReplayDetector) {
        let (dark, faces): (Vec<bool>, Vec<Vec<Detection>>) = self.frames.into_iter().map(|f| (f.dark, f.faces)).unzip();
        (
            ReplayFrames {
                width: self.width,
                height: self.height,
                dark,
                next: 0,
            },
            ReplayDetector { faces },
        )
    }
}

pub struct ReplayFrames {
    width: u32,
    height: u32,
    dark: Vec<bool>,
    next: usize,
}

impl ReplayFrames {
    pub fn frame_count(&self) -> usize {
        self.dark.len()
    }
}

#[async_trait]
impl FrameSource for ReplayFrames {
    async fn next_frame(&mut self) -> Result<Frame, FrameError> {
        let Some(&dark) = self.dark.get(self.next) else {
            return Err(FrameError::Exhausted);
        };
        let sequence = self.next as u64;
        self.next += 1;

        let pixel = if dark { 0 } else { LIT_PIXEL };
        let size = (self.width as usize) * (self.height as usize);
        Frame::from_gray(vec![pixel; size], self.width, self.height, sequence)
    }
}

pub struct ReplayDetector {
    faces: Vec<Vec<Detection>>,
}

impl FaceDetector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        usize::try_from(frame.sequence)
            .ok()
            .and_then(|i| self.faces.get(i))
            .cloned()
            .ok_or_else(|| DetectError::Failed(format!("no recorded faces for frame {}", frame.sequence)))
    }
}

//! Descriptor sources: the seam to whatever face model produces descriptors.
//!
//! The core never runs a model itself. Async sources implement
//! [`DescriptorSource`] directly; blocking models implement [`FaceDetector`]
//! and are moved onto a dedicated thread with [`spawn_detector`].

use crate::frame::Frame;
use crate::types::Detection;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("detection failed: {0}")]
    Failed(String),
    #[error("detector thread exited")]
    ChannelClosed,
    #[error("failed to spawn detector thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Async face detection + description for a single frame.
///
/// Returns an empty list when no face is found and one entry per face
/// otherwise.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

/// Blocking face model, e.g. an inference session bound to one thread.
pub trait FaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

struct DetectRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<Vec<Detection>, DetectError>>,
}

/// Clone-safe handle to a detector thread.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<DetectRequest>,
}

#[async_trait]
impl DescriptorSource for DetectorHandle {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DetectRequest {
                frame: frame.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| DetectError::ChannelClosed)?;
        reply_rx.await.map_err(|_| DetectError::ChannelClosed)?
    }
}

/// Run a blocking detector on its own OS thread.
///
/// Requests are served one at a time in arrival order. The thread exits
/// once every handle has been dropped.
pub fn spawn_detector<D>(mut detector: D) -> Result<DetectorHandle, DetectError>
where
    D: FaceDetector + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-detector".into())
        .spawn(move || {
            tracing::info!("detector thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = detector.detect(&req.frame);
                if let Ok(faces) = &result {
                    tracing::trace!(seq = req.frame.sequence, faces = faces.len(), "frame described");
                }
                // Caller may have given up (per-attempt timeout); nothing to do then.
                let _ = req.reply.send(result);
            }
            tracing::info!("detector thread exiting");
        })?;

    Ok(DetectorHandle { tx })
}

//! Session orchestration: drives enrollment and recognition against live
//! frame and descriptor sources on a fixed cadence.
//!
//! Everything runs cooperatively on the caller's task. Enrollments for the
//! same identity are serialized; different identities may run side by side.

use crate::config::{ConfigError, SessionConfig};
use crate::frame::{Frame, FrameError, FrameSource};
use crate::matcher::{EuclideanMatcher, Matcher, Roster};
use crate::session::{
    AttemptError, AttemptOutcome, EnrollmentSession, FailureReason, SessionEvent, SessionState,
};
use crate::source::{DescriptorSource, DetectError};
use crate::store::TemplateStore;
use crate::types::{Detection, DimensionMismatch, FaceDecision, IdentityId, Template};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("detector error: {0}")]
    Detect(#[from] DetectError),
    #[error("detection timed out")]
    TimedOut,
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("scan cancelled")]
    Cancelled,
}

/// Caller side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Session side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if every handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

/// Final report of an enrollment session.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentOutcome {
    pub session_id: Uuid,
    pub identity_id: IdentityId,
    pub state: SessionState,
    /// Present only when the session completed and the template was stored.
    pub template: Option<Template>,
    pub attempts: usize,
    pub rejected: usize,
}

enum Attempt {
    Detected {
        frame_index: u64,
        captured_at: DateTime<Utc>,
        detections: Vec<Detection>,
    },
    Rejected(AttemptError),
    SourceClosed,
}

type EventSink = Option<mpsc::UnboundedSender<SessionEvent>>;

fn emit(events: &EventSink, event: SessionEvent) {
    if let Some(tx) = events {
        // Nobody listening is fine.
        let _ = tx.send(event);
    }
}

pub struct Orchestrator {
    config: SessionConfig,
    detector: Arc<dyn DescriptorSource>,
    store: Arc<dyn TemplateStore>,
    matcher: Arc<dyn Matcher>,
    enrolling: Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: SessionConfig,
        detector: Arc<dyn DescriptorSource>,
        store: Arc<dyn TemplateStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            detector,
            store,
            matcher: Arc::new(EuclideanMatcher),
            enrolling: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the default Euclidean matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TemplateStore> {
        &self.store
    }

    /// Run one enrollment session for `identity_id` to a terminal state.
    ///
    /// Waits for any other enrollment of the same identity to finish first.
    /// The template store is written only when the session completes.
    pub async fn enroll<F>(
        &self,
        identity_id: IdentityId,
        frames: &mut F,
        mut cancel: CancelToken,
        events: EventSink,
    ) -> EnrollmentOutcome
    where
        F: FrameSource + ?Sized,
    {
        let guard = self.identity_lock(&identity_id).await;
        let outcome = self
            .run_enrollment(identity_id, frames, &mut cancel, &events)
            .await;
        drop(guard);
        self.prune_locks().await;

        emit(
            &events,
            SessionEvent::Finished {
                state: outcome.state.clone(),
            },
        );
        outcome
    }

    async fn identity_lock(&self, id: &IdentityId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.enrolling.lock().await;
            map.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn prune_locks(&self) {
        let mut map = self.enrolling.lock().await;
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn run_enrollment<F>(
        &self,
        identity_id: IdentityId,
        frames: &mut F,
        cancel: &mut CancelToken,
        events: &EventSink,
    ) -> EnrollmentOutcome
    where
        F: FrameSource + ?Sized,
    {
        let mut session = EnrollmentSession::new(identity_id, &self.config);
        let session_id = session.id();
        let target = session.target_count();
        session.start();

        tracing::info!(
            session = %session_id,
            identity = %session.identity_id(),
            target,
            interval_ms = self.config.interval_ms,
            "enrollment started"
        );
        emit(
            events,
            SessionEvent::Started {
                session_id,
                identity_id: session.identity_id().clone(),
                target,
            },
        );

        let deadline = Instant::now() + self.config.total_session_timeout();
        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0usize;
        let mut rejected = 0usize;
        let mut prompted: Option<usize> = None;

        while *session.state() == SessionState::Capturing {
            let slot = session.captures().len();
            if prompted != Some(slot) {
                if let Some(text) = self.config.prompt_for(slot) {
                    emit(
                        events,
                        SessionEvent::Prompt {
                            slot,
                            text: text.to_string(),
                        },
                    );
                }
                prompted = Some(slot);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.cancel();
                    break;
                }
                _ = time::sleep_until(deadline) => {
                    session.time_out();
                    break;
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let attempt = time::timeout(self.config.per_attempt_timeout(), self.attempt(frames))
                .await
                .unwrap_or(Attempt::Rejected(AttemptError::TimedOut));

            // An in-flight attempt may finish after cancellation or the
            // deadline; its result is dropped.
            if cancel.is_cancelled() {
                session.cancel();
                break;
            }
            if Instant::now() >= deadline {
                session.time_out();
                break;
            }

            let rejection = match attempt {
                Attempt::SourceClosed => {
                    let captured = session.captures().len();
                    session.fail(FailureReason::FrameSourceClosed { captured, target });
                    break;
                }
                Attempt::Rejected(err) => err,
                Attempt::Detected {
                    frame_index,
                    captured_at,
                    detections,
                } => match session.record_attempt(frame_index, captured_at, detections) {
                    Ok(AttemptOutcome::Captured { count, target }) => {
                        tracing::debug!(session = %session_id, frame = frame_index, count, target, "capture accepted");
                        emit(events, SessionEvent::Captured { count, target });
                        continue;
                    }
                    Ok(AttemptOutcome::QuotaMet) => {
                        tracing::debug!(session = %session_id, frame = frame_index, "capture quota met");
                        emit(events, SessionEvent::Captured { count: target, target });
                        continue;
                    }
                    Ok(AttemptOutcome::Discarded) => continue,
                    Err(err @ AttemptError::DimensionMismatch(_)) => {
                        tracing::warn!(session = %session_id, error = %err, "descriptor source contract violated");
                        break;
                    }
                    Err(err) => err,
                },
            };

            rejected += 1;
            tracing::debug!(session = %session_id, reason = %rejection, "attempt rejected");
            emit(
                events,
                SessionEvent::AttemptRejected {
                    reason: rejection.to_string(),
                },
            );
        }

        let mut template = None;
        if let Some(built) = session.aggregate() {
            if cancel.is_cancelled() {
                session.cancel();
            } else {
                match self.store.put(&built).await {
                    Ok(()) => {
                        session.complete();
                        template = Some(built);
                    }
                    Err(err) => {
                        tracing::warn!(session = %session_id, error = %err, "template store rejected write");
                        session.fail(FailureReason::StoreWriteFailure {
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        match session.state() {
            SessionState::Complete => tracing::info!(
                session = %session_id,
                identity = %session.identity_id(),
                attempts,
                rejected,
                "enrollment complete"
            ),
            SessionState::Cancelled => tracing::info!(
                session = %session_id,
                identity = %session.identity_id(),
                "enrollment cancelled"
            ),
            state => tracing::warn!(
                session = %session_id,
                identity = %session.identity_id(),
                state = ?state,
                attempts,
                rejected,
                "enrollment failed"
            ),
        }

        EnrollmentOutcome {
            session_id,
            identity_id: session.identity_id().clone(),
            state: session.state().clone(),
            template,
            attempts,
            rejected,
        }
    }

    async fn attempt<F>(&self, frames: &mut F) -> Attempt
    where
        F: FrameSource + ?Sized,
    {
        let frame = match frames.next_frame().await {
            Ok(frame) => frame,
            Err(FrameError::Exhausted) => return Attempt::SourceClosed,
            Err(err) => return Attempt::Rejected(AttemptError::Source(err.to_string())),
        };

        if self.config.skip_dark_frames && frame.is_dark {
            tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "skipping dark frame");
            return Attempt::Rejected(AttemptError::DarkFrame);
        }

        match self.detector.detect(&frame).await {
            Ok(detections) => Attempt::Detected {
                frame_index: frame.sequence,
                captured_at: frame.timestamp,
                detections,
            },
            Err(err) => Attempt::Rejected(AttemptError::Source(err.to_string())),
        }
    }

    /// Match every face in `frame` against `roster`: one decision per face.
    pub async fn recognize_frame(
        &self,
        frame: &Frame,
        roster: &Roster,
    ) -> Result<Vec<FaceDecision>, RecognizeError> {
        roster.validate(self.config.descriptor_len)?;

        let detections = time::timeout(self.config.per_attempt_timeout(), self.detector.detect(frame))
            .await
            .map_err(|_| RecognizeError::TimedOut)??;

        let mut decisions = Vec::with_capacity(detections.len());
        for detection in detections {
            detection.descriptor.check_len(self.config.descriptor_len)?;
            let decision =
                self.matcher
                    .compare(&detection.descriptor, roster, self.config.match_threshold);
            decisions.push(FaceDecision {
                frame_index: frame.sequence,
                bbox: detection.bbox,
                decision,
            });
        }

        tracing::debug!(
            seq = frame.sequence,
            faces = decisions.len(),
            accepted = decisions.iter().filter(|d| d.decision.accepted).count(),
            "frame recognized"
        );
        Ok(decisions)
    }

    /// Recognize up to `scan_frames` frames at the session cadence.
    ///
    /// Frames that fail detection are skipped; a descriptor of the wrong
    /// dimension aborts the scan.
    pub async fn scan_class<F>(
        &self,
        frames: &mut F,
        roster: &Roster,
        mut cancel: CancelToken,
    ) -> Result<Vec<FaceDecision>, RecognizeError>
    where
        F: FrameSource + ?Sized,
    {
        roster.validate(self.config.descriptor_len)?;
        tracing::info!(roster = roster.len(), frames = self.config.scan_frames, "class scan started");

        let mut ticker = time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut decisions = Vec::new();

        for _ in 0..self.config.scan_frames {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RecognizeError::Cancelled),
                _ = ticker.tick() => {}
            }

            let frame = match frames.next_frame().await {
                Ok(frame) => frame,
                Err(FrameError::Exhausted) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "frame capture failed; skipping");
                    continue;
                }
            };
            if self.config.skip_dark_frames && frame.is_dark {
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }

            match self.recognize_frame(&frame, roster).await {
                Ok(mut found) => decisions.append(&mut found),
                Err(RecognizeError::DimensionMismatch(m)) => return Err(m.into()),
                Err(err) => tracing::warn!(seq = frame.sequence, error = %err, "frame skipped"),
            }

            if cancel.is_cancelled() {
                return Err(RecognizeError::Cancelled);
            }
        }

        tracing::info!(decisions = decisions.len(), "class scan finished");
        Ok(decisions)
    }
}

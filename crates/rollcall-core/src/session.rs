//! Enrollment session state machine.
//!
//! `Idle → Capturing → Aggregating → Complete | Failed | Cancelled`.
//! The machine itself never waits on anything; the async driver in
//! [`crate::orchestrator`] feeds it attempts and timing events.

use crate::aggregator::{AggregateError, Aggregator};
use crate::config::SessionConfig;
use crate::types::{Capture, Detection, DimensionMismatch, IdentityId, Template};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Why a single capture attempt produced no capture. Retried on the next tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("ambiguous subject: {count} faces in frame")]
    AmbiguousFace { count: usize },
    #[error("frame too dark")]
    DarkFrame,
    #[error("attempt timed out")]
    TimedOut,
    #[error("source error: {0}")]
    Source(String),
    /// Not retried: the session fails immediately.
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
}

/// Terminal failure codes reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout { captured: usize, target: usize },
    InsufficientCaptures { got: usize, required: usize },
    DimensionMismatch { expected: usize, actual: usize },
    StoreWriteFailure { message: String },
    FrameSourceClosed { captured: usize, target: usize },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { captured, target } => {
                write!(f, "timed out after {captured}/{target} captures")
            }
            Self::InsufficientCaptures { got, required } => {
                write!(f, "insufficient captures ({got} < {required})")
            }
            Self::DimensionMismatch { expected, actual } => {
                write!(f, "descriptor length {actual}, expected {expected}")
            }
            Self::StoreWriteFailure { message } => write!(f, "template store write failed: {message}"),
            Self::FrameSourceClosed { captured, target } => {
                write!(f, "frame source closed after {captured}/{target} captures")
            }
        }
    }
}

impl From<AggregateError> for FailureReason {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::InsufficientCaptures { got, required } => {
                Self::InsufficientCaptures { got, required }
            }
            AggregateError::DimensionMismatch(m) => Self::DimensionMismatch {
                expected: m.expected,
                actual: m.actual,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Aggregating,
    Complete,
    Failed(FailureReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_) | Self::Cancelled)
    }
}

/// Result of feeding one attempt's detections to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Captured { count: usize, target: usize },
    /// The capture quota is met; the session moved to `Aggregating`.
    QuotaMet,
    /// The session is no longer capturing; the result was dropped.
    Discarded,
}

/// Progress notifications for whoever is guiding the enrollee.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { session_id: Uuid, identity_id: IdentityId, target: usize },
    Prompt { slot: usize, text: String },
    Captured { count: usize, target: usize },
    AttemptRejected { reason: String },
    Finished { state: SessionState },
}

/// In-progress enrollment for one identity.
#[derive(Debug)]
pub struct EnrollmentSession {
    id: Uuid,
    identity_id: IdentityId,
    target_count: usize,
    descriptor_len: usize,
    aggregator: Aggregator,
    state: SessionState,
    captures: Vec<Capture>,
}

impl EnrollmentSession {
    pub fn new(identity_id: IdentityId, config: &SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            target_count: config.target_count,
            descriptor_len: config.descriptor_len,
            aggregator: Aggregator::new(config.descriptor_len, config.min_captures),
            state: SessionState::Idle,
            captures: Vec::with_capacity(config.target_count),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity_id(&self) -> &IdentityId {
        &self.identity_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn target_count(&self) -> usize {
        self.target_count
    }

    /// Captures collected so far, in temporal order.
    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }

    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Capturing;
        } else {
            tracing::warn!(session = %self.id, state = ?self.state, "start ignored: session already started");
        }
    }

    /// Feed the detections from one frame.
    ///
    /// Exactly one face yields a capture; none or several are rejected
    /// without counting the attempt. A wrong-length descriptor fails the
    /// whole session.
    pub fn record_attempt(
        &mut self,
        frame_index: u64,
        captured_at: DateTime<Utc>,
        mut detections: Vec<Detection>,
    ) -> Result<AttemptOutcome, AttemptError> {
        if self.state != SessionState::Capturing {
            return Ok(AttemptOutcome::Discarded);
        }

        let detection = match detections.len() {
            0 => return Err(AttemptError::NoFaceDetected),
            1 => detections.remove(0),
            count => return Err(AttemptError::AmbiguousFace { count }),
        };

        if let Err(mismatch) = detection.descriptor.check_len(self.descriptor_len) {
            self.fail(FailureReason::DimensionMismatch {
                expected: mismatch.expected,
                actual: mismatch.actual,
            });
            return Err(mismatch.into());
        }

        self.captures.push(Capture {
            descriptor: detection.descriptor,
            frame_index,
            captured_at,
        });

        if self.captures.len() >= self.target_count {
            self.state = SessionState::Aggregating;
            Ok(AttemptOutcome::QuotaMet)
        } else {
            Ok(AttemptOutcome::Captured {
                count: self.captures.len(),
                target: self.target_count,
            })
        }
    }

    /// Build the template from the collected captures.
    ///
    /// Only valid in `Aggregating`; the session stays there until the
    /// template is persisted ([`complete`](Self::complete)) or rejected.
    pub fn aggregate(&mut self) -> Option<Template> {
        if self.state != SessionState::Aggregating {
            return None;
        }
        match self.aggregator.aggregate(&self.identity_id, &self.captures) {
            Ok(template) => Some(template),
            Err(err) => {
                self.fail(err.into());
                None
            }
        }
    }

    /// Template persisted.
    pub fn complete(&mut self) {
        if self.state == SessionState::Aggregating {
            self.state = SessionState::Complete;
        }
    }

    /// The session deadline passed while capturing.
    ///
    /// Fails even when `min_captures` were reached: the guided sequence
    /// was not completed.
    pub fn time_out(&mut self) {
        if self.state == SessionState::Capturing {
            let captured = self.captures.len();
            self.fail(FailureReason::Timeout {
                captured,
                target: self.target_count,
            });
        }
    }

    /// Caller cancelled. Discards every capture. No effect once terminal.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.captures.clear();
            self.state = SessionState::Cancelled;
        }
    }

    /// Fail with `reason`, discarding captures. No effect once terminal.
    pub fn fail(&mut self, reason: FailureReason) {
        if !self.state.is_terminal() {
            self.captures.clear();
            self.state = SessionState::Failed(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Descriptor};

    fn config() -> SessionConfig {
        SessionConfig {
            target_count: 3,
            min_captures: 3,
            descriptor_len: 3,
            ..SessionConfig::default()
        }
    }

    fn face(values: Vec<f32>) -> Detection {
        Detection {
            descriptor: Descriptor::new(values),
            bbox: BoundingBox::default(),
        }
    }

    fn started() -> EnrollmentSession {
        let mut session = EnrollmentSession::new(IdentityId::from("s1"), &config());
        session.start();
        session
    }

    #[test]
    fn test_starts_idle() {
        let session = EnrollmentSession::new(IdentityId::from("s1"), &config());
        assert_eq!(session.state(), &SessionState::Idle);
    }

    #[test]
    fn test_attempt_before_start_is_discarded() {
        let mut session = EnrollmentSession::new(IdentityId::from("s1"), &config());
        let outcome = session
            .record_attempt(0, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])])
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Discarded);
        assert!(session.captures().is_empty());
    }

    #[test]
    fn test_full_enrollment() {
        let mut session = started();
        let r1 = session.record_attempt(0, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])]);
        assert_eq!(r1, Ok(AttemptOutcome::Captured { count: 1, target: 3 }));
        session
            .record_attempt(1, Utc::now(), vec![face(vec![0.0, 1.0, 0.0])])
            .unwrap();
        let r3 = session.record_attempt(2, Utc::now(), vec![face(vec![0.0, 0.0, 1.0])]);
        assert_eq!(r3, Ok(AttemptOutcome::QuotaMet));
        assert_eq!(session.state(), &SessionState::Aggregating);

        let template = session.aggregate().unwrap();
        assert_eq!(template.source_capture_count, 3);
        assert_eq!(template.identity_id, IdentityId::from("s1"));
        for v in &template.descriptor.values {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }

        session.complete();
        assert_eq!(session.state(), &SessionState::Complete);
    }

    #[test]
    fn test_captures_keep_frame_order() {
        let mut session = started();
        for idx in [4, 9] {
            session
                .record_attempt(idx, Utc::now(), vec![face(vec![0.0, 0.0, 1.0])])
                .unwrap();
        }
        let indices: Vec<u64> = session.captures().iter().map(|c| c.frame_index).collect();
        assert_eq!(indices, vec![4, 9]);
    }

    #[test]
    fn test_no_face_not_counted() {
        let mut session = started();
        let err = session.record_attempt(0, Utc::now(), Vec::new()).unwrap_err();
        assert_eq!(err, AttemptError::NoFaceDetected);
        assert!(session.captures().is_empty());
        assert_eq!(session.state(), &SessionState::Capturing);
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let mut session = started();
        let err = session
            .record_attempt(
                0,
                Utc::now(),
                vec![face(vec![1.0, 0.0, 0.0]), face(vec![0.0, 1.0, 0.0])],
            )
            .unwrap_err();
        assert_eq!(err, AttemptError::AmbiguousFace { count: 2 });
        assert!(session.captures().is_empty());
        assert_eq!(session.state(), &SessionState::Capturing);
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let mut session = started();
        session
            .record_attempt(0, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])])
            .unwrap();
        let err = session
            .record_attempt(1, Utc::now(), vec![face(vec![1.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, AttemptError::DimensionMismatch(_)));
        assert_eq!(
            session.state(),
            &SessionState::Failed(FailureReason::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert!(session.captures().is_empty());
    }

    #[test]
    fn test_timeout_fails_even_above_minimum() {
        let cfg = SessionConfig {
            target_count: 5,
            min_captures: 3,
            descriptor_len: 3,
            ..SessionConfig::default()
        };
        let mut session = EnrollmentSession::new(IdentityId::from("s1"), &cfg);
        session.start();
        for i in 0..4 {
            session
                .record_attempt(i, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])])
                .unwrap();
        }
        session.time_out();
        assert_eq!(
            session.state(),
            &SessionState::Failed(FailureReason::Timeout { captured: 4, target: 5 })
        );
        assert!(session.captures().is_empty());
    }

    #[test]
    fn test_cancel_discards_captures() {
        let mut session = started();
        session
            .record_attempt(0, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])])
            .unwrap();
        session.cancel();
        assert_eq!(session.state(), &SessionState::Cancelled);
        assert!(session.captures().is_empty());
        assert!(session.aggregate().is_none());

        let late = session.record_attempt(1, Utc::now(), vec![face(vec![1.0, 0.0, 0.0])]);
        assert_eq!(late, Ok(AttemptOutcome::Discarded));
    }

    #[test]
    fn test_terminal_states_stick() {
        let mut session = started();
        session.time_out();
        session.cancel();
        assert!(matches!(session.state(), SessionState::Failed(FailureReason::Timeout { .. })));
    }
}

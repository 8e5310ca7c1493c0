//! Enrollment followed by recognition through the public API.

use async_trait::async_trait;
use rollcall_core::{
    spawn_detector, AttendanceSheet, AttendanceStatus, BoundingBox, CancelToken, Descriptor,
    DetectError, Detection, FaceDetector, Frame, FrameError, FrameSource, IdentityId,
    MemoryTemplateStore, Orchestrator, Roster, SessionConfig, SessionState, TemplateStore,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Blocking detector that replays one detection list per frame.
struct Playback {
    frames: VecDeque<Vec<Vec<f32>>>,
}

impl FaceDetector for Playback {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let faces = self.frames.pop_front().unwrap_or_default();
        Ok(faces
            .into_iter()
            .map(|values| Detection {
                descriptor: Descriptor::new(values),
                bbox: BoundingBox::default(),
            })
            .collect())
    }
}

struct Camera {
    sequence: u64,
}

#[async_trait]
impl FrameSource for Camera {
    async fn next_frame(&mut self) -> Result<Frame, FrameError> {
        self.sequence += 1;
        Frame::from_gray(vec![120u8; 16], 4, 4, self.sequence)
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        target_count: 3,
        min_captures: 3,
        descriptor_len: 3,
        interval_ms: 10,
        per_attempt_timeout_ms: 1000,
        total_session_timeout_ms: 5000,
        match_threshold: 0.3,
        ..SessionConfig::default()
    }
}

fn orchestrator(frames: Vec<Vec<Vec<f32>>>, store: Arc<MemoryTemplateStore>) -> Orchestrator {
    let detector = spawn_detector(Playback {
        frames: frames.into(),
    })
    .unwrap();
    Orchestrator::new(config(), Arc::new(detector), store).unwrap()
}

#[tokio::test]
async fn enroll_unit_vectors_yields_centroid() {
    let store = Arc::new(MemoryTemplateStore::new());
    let orch = orchestrator(
        vec![
            vec![vec![1.0, 0.0, 0.0]],
            vec![vec![0.0, 1.0, 0.0]],
            vec![vec![0.0, 0.0, 1.0]],
        ],
        store.clone(),
    );

    let outcome = orch
        .enroll(
            IdentityId::from("A"),
            &mut Camera { sequence: 0 },
            CancelToken::never(),
            None,
        )
        .await;
    assert_eq!(outcome.state, SessionState::Complete);

    let template = store.get(&IdentityId::from("A")).await.unwrap().unwrap();
    assert_eq!(template.descriptor.len(), 3);
    for v in &template.descriptor.values {
        assert!((v - 1.0 / 3.0).abs() < 1e-6);
    }
}

#[tokio::test]
async fn enroll_then_take_attendance() {
    let store = Arc::new(MemoryTemplateStore::new());
    // Two enrollments (3 frames each), then one classroom frame with
    // A near its template and a stranger between A and B.
    let orch = orchestrator(
        vec![
            vec![vec![1.0, 0.0, 0.0]],
            vec![vec![1.0, 0.0, 0.0]],
            vec![vec![1.0, 0.0, 0.0]],
            vec![vec![0.0, 1.0, 0.0]],
            vec![vec![0.0, 1.0, 0.0]],
            vec![vec![0.0, 1.0, 0.0]],
            vec![vec![0.95, 0.1, 0.0], vec![0.5, 0.5, 0.0]],
        ],
        store.clone(),
    );

    let mut camera = Camera { sequence: 0 };
    for id in ["A", "B"] {
        let outcome = orch
            .enroll(IdentityId::from(id), &mut camera, CancelToken::never(), None)
            .await;
        assert_eq!(outcome.state, SessionState::Complete, "enrolling {id}");
    }

    let roster: Roster = store.list().await.unwrap().into_iter().collect();
    assert_eq!(roster.len(), 2);

    let frame = camera.next_frame().await.unwrap();
    let decisions = orch.recognize_frame(&frame, &roster).await.unwrap();
    assert_eq!(decisions.len(), 2);

    let near_a = &decisions[0].decision;
    assert!(near_a.accepted);
    assert_eq!(near_a.identity_id, Some(IdentityId::from("A")));
    assert!((near_a.distance - 0.112).abs() < 1e-3);

    let stranger = &decisions[1].decision;
    assert!(!stranger.accepted);
    assert_eq!(stranger.identity_id, None);
    assert!(stranger.distance > 0.3);

    let sheet = AttendanceSheet::from_decisions(&roster, &decisions);
    assert_eq!(sheet.status(&IdentityId::from("A")), Some(AttendanceStatus::Present));
    assert_eq!(sheet.status(&IdentityId::from("B")), Some(AttendanceStatus::Absent));
    assert_eq!(sheet.unknown_faces, 1);
}

#[tokio::test]
async fn empty_roster_never_matches() {
    let store = Arc::new(MemoryTemplateStore::new());
    let orch = orchestrator(vec![vec![vec![1.0, 0.0, 0.0]]], store);

    let frame = Frame::from_gray(vec![120u8; 4], 2, 2, 1).unwrap();
    let decisions = orch.recognize_frame(&frame, &Roster::new()).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(!decisions[0].decision.accepted);
    assert_eq!(decisions[0].decision.identity_id, None);
}

//! rollcall-core — Face enrollment and matching for attendance.
//!
//! Captures several face descriptors per enrollee, averages them into a
//! template, and matches live descriptors against a roster of templates
//! under a Euclidean distance threshold. The face model, camera and
//! template persistence are collaborators behind traits.

pub mod aggregator;
pub mod attendance;
pub mod config;
pub mod frame;
pub mod matcher;
pub mod orchestrator;
pub mod session;
pub mod source;
pub mod store;
pub mod types;

pub use aggregator::{AggregateError, Aggregator};
pub use attendance::{AttendanceSheet, AttendanceStatus};
pub use config::{ConfigError, SessionConfig};
pub use frame::{Frame, FrameError, FrameSource};
pub use matcher::{EuclideanMatcher, Matcher, Roster};
pub use orchestrator::{cancel_pair, CancelHandle, CancelToken, EnrollmentOutcome, Orchestrator, RecognizeError};
pub use session::{FailureReason, SessionEvent, SessionState};
pub use source::{spawn_detector, DescriptorSource, DetectError, FaceDetector};
pub use store::{MemoryTemplateStore, StoreError, TemplateStore};
pub use types::{BoundingBox, Capture, Descriptor, Detection, FaceDecision, IdentityId, MatchDecision, Template};

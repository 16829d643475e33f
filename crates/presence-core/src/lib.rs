//! presence-core: Location- and face-gated attendance verification.
//!
//! An attendance submission is accepted only when the claimed position lies
//! inside a registered zone and a live camera capture matches the person's
//! reference face. Persistence, image storage, the camera and the face model
//! are collaborators behind traits.

pub mod capture;
pub mod extractor;
pub mod geofence;
pub mod matcher;
pub mod onnx;
pub mod orchestrator;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capture::{CaptureDevice, CaptureError, CaptureGuard, CaptureStream};
pub use extractor::{DescriptorExtractor, ExtractError, ModelLoader};
pub use geofence::{is_within_zone, GeofenceCheck, GeofenceError};
pub use matcher::{
    CancelOutcome, FaceMatcher, FaceSide, MatchFailure, MatcherConfig, MatcherState,
};
pub use onnx::OnnxModelLoader;
pub use orchestrator::{Orchestrator, VerificationError};
pub use store::{AttendanceStore, FetchError, ReferenceImageSource, StoreError};
pub use types::{
    AttendanceClaim, AttendanceEvent, CheckType, Descriptor, Frame, HistoryEntry, ImageRef,
    NewAttendanceEvent, PersonId, SessionContext, SessionType, VerificationOutcome, Zone, ZoneId,
};

//! Pure logic for document capture and liveness verification: no camera,
//! network or storage access happens in this crate.

pub mod devices;
pub mod document;
pub mod frame;
pub mod gate;
pub mod liveness;
pub mod object;
pub mod verification;

pub use devices::{DeviceConstraint, DeviceDescriptor, DevicePin, Facing, RawDevice, StreamRequest};
pub use frame::{CropRect, FrameView, GuideRect, RgbaFrame};
pub use gate::{GateConfig, GateProfile, GateReport, QualityVerdict};
pub use liveness::{
    LivenessSession, ReferenceImageRef, SessionResults, SessionSettings, SessionStatus,
};
pub use object::ObjectLocation;
pub use verification::{
    AttemptOutcome, AttemptStatus, DocumentRecord, VerificationAttempt, VerificationPolicy,
    VerificationState, VerificationStateMachine, VerificationSummary,
};

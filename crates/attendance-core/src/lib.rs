//! attendance-core — Face detection, recognition and attendance bookkeeping.
//!
//! SCRFD (ONNX Runtime) locates faces; an LBPH model trained on stored face
//! crops identifies them; marks are kept in per-day CSV ledgers.

pub mod detector;
pub mod lbp;
pub mod ledger;
pub mod recognizer;
pub mod store;
pub mod trainer;
pub mod types;

pub use detector::{DetectorError, FaceDetector, FaceLocator};
pub use ledger::{AttendanceLedger, LedgerError, MarkOutcome};
pub use recognizer::{LbphModel, ModelError};
pub use store::{SampleStore, StoreError};
pub use trainer::{ModelTrainer, TrainError, TrainSummary};
pub use types::{AttendanceRecord, BoundingBox, Employee, EmployeeId, FaceRect, Prediction, Sample};

/// Default acceptance threshold for LBPH distances (accept when strictly below).
pub const DEFAULT_ACCEPTANCE_THRESHOLD: f64 = 70.0;

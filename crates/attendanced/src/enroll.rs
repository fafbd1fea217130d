//! Enrollment: capture face crops for one employee, register them in the
//! roster and retrain the model.

use attendance_core::{EmployeeId, FaceLocator, ModelTrainer, SampleStore, StoreError, TrainError, TrainSummary};
use attendance_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::session::CancelToken;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("employee name must not be empty")]
    EmptyName,
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("camera read failed {failures} times in a row: {last}")]
    ReadFailures {
        failures: u32,
        #[source]
        last: CameraError,
    },
    #[error("enrollment cancelled before any face was captured")]
    Cancelled,
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("training: {0}")]
    Train(#[from] TrainError),
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollSummary {
    pub employee_id: EmployeeId,
    pub name: String,
    /// Enrollment session number the new samples were filed under.
    pub session: u32,
    pub captured: u32,
    pub target: u32,
    pub training: TrainSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnrollEvent {
    Progress {
        employee_id: EmployeeId,
        captured: u32,
        target: u32,
    },
    Completed {
        summary: EnrollSummary,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct EnrollSettings {
    /// Samples to capture before stopping.
    pub target: u32,
    pub max_consecutive_read_failures: u32,
    /// Pause after each frame that produced a sample.
    pub frame_interval: Duration,
    pub read_retry_delay: Duration,
}

impl EnrollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target: config.samples_per_enroll.max(1),
            max_consecutive_read_failures: config.max_consecutive_read_failures.max(1),
            frame_interval: config.enroll_frame_interval(),
            read_retry_delay: config.read_retry_delay(),
        }
    }
}

/// Everything an enrollment writes to.
pub struct EnrollTargets<'a> {
    pub store: &'a SampleStore,
    pub trainer: &'a ModelTrainer,
    pub model_path: &'a Path,
    /// Held while training so concurrent retrains do not interleave writes.
    pub train_lock: &'a Mutex<()>,
}

/// One pending enrollment.
pub struct Enrollment {
    employee_id: EmployeeId,
    name: String,
    settings: EnrollSettings,
    cancel: CancelToken,
}

impl Enrollment {
    pub fn new(
        employee_id: EmployeeId,
        name: &str,
        settings: EnrollSettings,
        cancel: CancelToken,
    ) -> Result<Self, EnrollError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }
        Ok(Self {
            employee_id,
            name: name.to_string(),
            settings,
            cancel,
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Capture until the target is reached or the enrollment is cancelled,
    /// then register the employee and retrain.
    ///
    /// Cancelling after at least one sample keeps what was captured. The
    /// camera is released before training starts.
    pub fn run<S: FrameSource, D: FaceLocator + ?Sized>(
        self,
        open_camera: impl FnOnce() -> Result<S, CameraError>,
        detector: &mut D,
        targets: EnrollTargets<'_>,
        progress: &mut dyn FnMut(EnrollEvent),
    ) -> Result<EnrollSummary, EnrollError> {
        let id = self.employee_id;
        let target = self.settings.target;

        let mut source = open_camera()?;
        let session = targets.store.begin_enrollment(id)?;
        tracing::info!(employee_id = id, name = %self.name, session, target, "enrollment started");

        let mut captured = 0u32;
        let mut failures = 0u32;

        while captured < target && !self.cancel.is_cancelled() {
            let frame = match source.read_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(failures, error = %e, "camera read failed");
                    if failures >= self.settings.max_consecutive_read_failures {
                        return Err(EnrollError::ReadFailures { failures, last: e });
                    }
                    std::thread::sleep(self.settings.read_retry_delay);
                    continue;
                }
            };

            let faces = match detector.detect(&frame.data, frame.width, frame.height) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed");
                    continue;
                }
            };

            let before = captured;
            for face in faces {
                if captured >= target {
                    break;
                }
                let Some(crop) = face
                    .to_rect(frame.width, frame.height)
                    .and_then(|rect| rect.crop(&frame.data, frame.width, frame.height))
                else {
                    continue;
                };
                if !targets.trainer.accepts(&crop) {
                    tracing::debug!(width = crop.width(), height = crop.height(), "face too small, skipped");
                    continue;
                }
                targets.store.add_sample(id, &crop)?;
                captured += 1;
                progress(EnrollEvent::Progress {
                    employee_id: id,
                    captured,
                    target,
                });
            }

            if captured > before && captured < target && !self.settings.frame_interval.is_zero() {
                std::thread::sleep(self.settings.frame_interval);
            }
        }
        drop(source);

        if captured == 0 {
            tracing::info!(employee_id = id, "enrollment cancelled with no samples");
            return Err(EnrollError::Cancelled);
        }
        if captured < target {
            tracing::info!(employee_id = id, captured, target, "enrollment cancelled, keeping partial capture");
        }

        targets.store.upsert_employee(id, &self.name)?;
        let training = {
            let _guard = targets.train_lock.lock().unwrap_or_else(|e| e.into_inner());
            targets.trainer.train_and_save(targets.store, targets.model_path)?
        };

        tracing::info!(employee_id = id, captured, samples = training.samples, "enrollment complete");
        Ok(EnrollSummary {
            employee_id: id,
            name: self.name,
            session,
            captured,
            target,
            training,
        })
    }
}

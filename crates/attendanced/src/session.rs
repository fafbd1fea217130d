//! Recognition session: the capture → detect → classify → mark loop.
//!
//! A session owns its frame source for its whole lifetime and moves through
//! `Idle → Running → (Stopped | Failed)`. The loop is pull-based; cancellation
//! is checked once per frame.

use attendance_core::{
    AttendanceLedger, AttendanceRecord, EmployeeId, FaceLocator, LbphModel, LedgerError, MarkOutcome, ModelError,
    SampleStore, StoreError,
};
use attendance_hw::{CameraError, FrameSource};
use chrono::{Local, NaiveTime};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("camera read failed {failures} times in a row: {last}")]
    ReadFailures {
        failures: u32,
        #[source]
        last: CameraError,
    },
    #[error("attendance ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Stop after the first recognized employee.
    SingleShot,
    /// Keep marking until cancelled.
    Continuous,
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-shot" | "single_shot" | "" => Ok(Self::SingleShot),
            "continuous" => Ok(Self::Continuous),
            other => Err(format!("unknown session mode {other:?} (expected \"single\" or \"continuous\")")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    /// Single-shot session marked someone.
    Recognized,
    /// Single-shot session recognized someone already marked today.
    AlreadyMarked,
    TimedOut,
}

/// What a running session reports to its observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Marked {
        record: AttendanceRecord,
    },
    AlreadyMarked {
        employee_id: EmployeeId,
        name: String,
        first_marked_at: NaiveTime,
    },
    /// A face that could not be attributed: either no training identity was
    /// close enough (`employee_id` is `None`) or the matched id is missing
    /// from the roster.
    Unknown {
        employee_id: Option<EmployeeId>,
        distance: f64,
    },
    Stopped {
        reason: StopReason,
    },
    Failed {
        error: String,
    },
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub acceptance_threshold: f64,
    pub max_consecutive_read_failures: u32,
    /// Stop with [`StopReason::TimedOut`] after this long.
    pub timeout: Option<Duration>,
    pub read_retry_delay: Duration,
}

impl SessionSettings {
    /// Settings for `mode`. Only single-shot sessions time out.
    pub fn from_config(config: &Config, mode: SessionMode) -> Self {
        Self {
            acceptance_threshold: config.acceptance_threshold,
            max_consecutive_read_failures: config.max_consecutive_read_failures.max(1),
            timeout: match mode {
                SessionMode::SingleShot => config.single_shot_timeout(),
                SessionMode::Continuous => None,
            },
            read_retry_delay: config.read_retry_delay(),
        }
    }
}

pub struct RecognitionSession<S> {
    mode: SessionMode,
    settings: SessionSettings,
    cancel: CancelToken,
    state: SessionState,
    source: Option<S>,
    model: Option<LbphModel>,
    started_at: Option<Instant>,
}

impl<S: FrameSource> RecognitionSession<S> {
    pub fn new(mode: SessionMode, settings: SessionSettings, cancel: CancelToken) -> Self {
        Self {
            mode,
            settings,
            cancel,
            state: SessionState::Idle,
            source: None,
            model: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Load the recognition model and acquire the camera.
    ///
    /// The model is loaded first so a missing or corrupt model never grabs the
    /// camera. Any failure leaves the session `Failed`.
    pub fn start(
        &mut self,
        open_camera: impl FnOnce() -> Result<S, CameraError>,
        model_path: &Path,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Idle)?;

        let model = LbphModel::load(model_path).map_err(|e| self.fail(e.into()))?;
        let source = open_camera().map_err(|e| self.fail(e.into()))?;

        tracing::info!(
            mode = ?self.mode,
            identities = model.labels().len(),
            threshold = self.settings.acceptance_threshold,
            "recognition session started"
        );
        self.model = Some(model);
        self.source = Some(source);
        self.started_at = Some(Instant::now());
        self.state = SessionState::Running;
        Ok(())
    }

    /// Drive the session until it stops or fails.
    ///
    /// Every outcome, including the terminal `Stopped`/`Failed`, is passed to
    /// `emit`. The camera is released before the terminal event. Each accepted
    /// face attempts a mark on every frame; the same id twice in one frame
    /// counts once.
    pub fn run<D: FaceLocator + ?Sized>(
        &mut self,
        detector: &mut D,
        store: &SampleStore,
        ledger: &AttendanceLedger,
        emit: &mut dyn FnMut(SessionEvent),
    ) -> Result<StopReason, SessionError> {
        self.expect_state(SessionState::Running)?;

        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(StopReason::Cancelled, emit));
            }
            if let (Some(timeout), Some(started)) = (self.settings.timeout, self.started_at) {
                if started.elapsed() >= timeout {
                    return Ok(self.finish(StopReason::TimedOut, emit));
                }
            }

            let Some(source) = self.source.as_mut() else {
                return Err(SessionError::InvalidState {
                    expected: SessionState::Running,
                    actual: self.state,
                });
            };
            let frame = match source.read_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(failures, error = %e, "camera read failed");
                    if failures >= self.settings.max_consecutive_read_failures {
                        let err = self.fail(SessionError::ReadFailures { failures, last: e });
                        emit(SessionEvent::Failed { error: err.to_string() });
                        return Err(err);
                    }
                    std::thread::sleep(self.settings.read_retry_delay);
                    continue;
                }
            };

            let faces = match detector.detect(&frame.data, frame.width, frame.height) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, sequence = frame.sequence, "face detection failed");
                    continue;
                }
            };
            tracing::debug!(faces = faces.len(), sequence = frame.sequence, "frame processed");

            let mut seen: HashSet<EmployeeId> = HashSet::new();

            for face in &faces {
                let Some(crop) = face
                    .to_rect(frame.width, frame.height)
                    .and_then(|rect| rect.crop(&frame.data, frame.width, frame.height))
                else {
                    continue;
                };
                let Some(model) = self.model.as_ref() else {
                    continue;
                };
                let prediction = match model.classify(&crop) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "face classification failed");
                        continue;
                    }
                };

                if !prediction.is_accepted(self.settings.acceptance_threshold) {
                    emit(SessionEvent::Unknown {
                        employee_id: None,
                        distance: prediction.distance,
                    });
                    continue;
                }

                let id = prediction.employee_id;
                if !seen.insert(id) {
                    continue;
                }

                let name = match store.employee_name(id) {
                    Ok(name) => name,
                    Err(StoreError::NotFound(_)) => {
                        tracing::warn!(employee_id = id, "recognized id missing from roster");
                        emit(SessionEvent::Unknown {
                            employee_id: Some(id),
                            distance: prediction.distance,
                        });
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(employee_id = id, error = %e, "roster lookup failed");
                        continue;
                    }
                };

                let now = Local::now().naive_local();
                let outcome = match ledger.mark(now.date(), id, &name, now.time()) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let err = self.fail(e.into());
                        emit(SessionEvent::Failed { error: err.to_string() });
                        return Err(err);
                    }
                };

                match outcome {
                    MarkOutcome::Marked(record) => {
                        tracing::info!(employee_id = id, distance = prediction.distance, "recognized");
                        emit(SessionEvent::Marked { record });
                        if self.mode == SessionMode::SingleShot {
                            return Ok(self.finish(StopReason::Recognized, emit));
                        }
                    }
                    MarkOutcome::AlreadyMarked(existing) => {
                        tracing::debug!(employee_id = id, "already marked today");
                        emit(SessionEvent::AlreadyMarked {
                            employee_id: id,
                            name: existing.name,
                            first_marked_at: existing.time,
                        });
                        if self.mode == SessionMode::SingleShot {
                            return Ok(self.finish(StopReason::AlreadyMarked, emit));
                        }
                    }
                }
            }
        }
    }

    /// Release the camera and stop. Returns `false` if the session had
    /// already stopped or failed.
    pub fn stop(&mut self) -> bool {
        self.cancel.cancel();
        match self.state {
            SessionState::Stopped | SessionState::Failed => false,
            SessionState::Idle | SessionState::Running => {
                self.release();
                self.state = SessionState::Stopped;
                true
            }
        }
    }

    fn finish(&mut self, reason: StopReason, emit: &mut dyn FnMut(SessionEvent)) -> StopReason {
        self.release();
        self.state = SessionState::Stopped;
        tracing::info!(?reason, "recognition session stopped");
        emit(SessionEvent::Stopped { reason });
        reason
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.release();
        self.state = SessionState::Failed;
        tracing::error!(error = %err, "recognition session failed");
        err
    }

    fn release(&mut self) {
        self.source = None;
        self.model = None;
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        blank_frame, checkerboard, frame_of, horizontal_stripes, read_error, vertical_stripes, Fixture,
        ScriptedCamera, WholeFrameLocator,
    };

    fn settings(max_failures: u32) -> SessionSettings {
        SessionSettings {
            acceptance_threshold: 70.0,
            max_consecutive_read_failures: max_failures,
            timeout: None,
            read_retry_delay: Duration::ZERO,
        }
    }

    fn run_scripted(
        fixture: &Fixture,
        mode: SessionMode,
        settings: SessionSettings,
        script: Vec<Result<attendance_hw::Frame, CameraError>>,
    ) -> (Result<StopReason, SessionError>, Vec<SessionEvent>, SessionState) {
        let cancel = CancelToken::new();
        let mut session = RecognitionSession::new(mode, settings, cancel.clone());
        session
            .start(|| Ok(ScriptedCamera::new(script, cancel)), &fixture.model_path)
            .unwrap();

        let mut events = Vec::new();
        let result = session.run(&mut WholeFrameLocator, &fixture.store, &fixture.ledger, &mut |e: SessionEvent| events.push(e));
        (result, events, session.state())
    }

    fn today() -> chrono::NaiveDate {
        Local::now().date_naive()
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("single".parse::<SessionMode>().unwrap(), SessionMode::SingleShot);
        assert_eq!("Continuous".parse::<SessionMode>().unwrap(), SessionMode::Continuous);
        assert!("forever".parse::<SessionMode>().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SessionEvent::Stopped {
            reason: StopReason::TimedOut,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"event": "stopped", "reason": "timed_out"}));
    }

    #[test]
    fn test_enrolled_face_marked_once() {
        let fixture = Fixture::new();
        let crops: Vec<_> = (0..5).map(|i| horizontal_stripes(30 + i * 5, 200)).collect();
        fixture.enroll(7, "Alice", &crops);

        let probe = frame_of(&horizontal_stripes(40, 210));
        let (result, events, state) =
            run_scripted(&fixture, SessionMode::SingleShot, settings(10), vec![Ok(probe.clone())]);
        assert_eq!(result.unwrap(), StopReason::Recognized);
        assert_eq!(state, SessionState::Stopped);
        match &events[0] {
            SessionEvent::Marked { record } => {
                assert_eq!(record.employee_id, 7);
                assert_eq!(record.name, "Alice");
            }
            other => panic!("expected Marked, got {other:?}"),
        }
        assert_eq!(events[1], SessionEvent::Stopped { reason: StopReason::Recognized });

        let (result, events, _) = run_scripted(&fixture, SessionMode::SingleShot, settings(10), vec![Ok(probe)]);
        assert_eq!(result.unwrap(), StopReason::AlreadyMarked);
        assert!(matches!(
            &events[0],
            SessionEvent::AlreadyMarked { employee_id: 7, name, .. } if name == "Alice"
        ));
        assert_eq!(events[1], SessionEvent::Stopped { reason: StopReason::AlreadyMarked });

        let records = fixture.ledger.list_for_date(today()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].employee_id, records[0].name.as_str()), (7, "Alice"));
    }

    #[test]
    fn test_continuous_marks_each_identity_once() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        fixture.enroll(2, "Carol", &[vertical_stripes(40, 200)]);
        fixture.enroll(3, "Dan", &[checkerboard()]);

        let script = vec![
            Ok(frame_of(&horizontal_stripes(45, 205))),
            Ok(frame_of(&vertical_stripes(35, 195))),
            Ok(frame_of(&horizontal_stripes(40, 200))),
            Ok(frame_of(&checkerboard())),
        ];
        let (result, events, _) = run_scripted(&fixture, SessionMode::Continuous, settings(10), script);
        assert_eq!(result.unwrap(), StopReason::Cancelled);

        let marked: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Marked { record } => Some(record.employee_id),
                _ => None,
            })
            .collect();
        assert_eq!(marked, vec![1, 2, 3]);
        assert!(matches!(events[2], SessionEvent::AlreadyMarked { employee_id: 1, .. }));
        assert_eq!(fixture.ledger.list_for_date(today()).unwrap().len(), 3);
    }

    #[test]
    fn test_face_held_in_view_reports_already_marked() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        fixture.enroll(2, "Carol", &[vertical_stripes(40, 200)]);

        let bob = frame_of(&horizontal_stripes(40, 200));
        let script = vec![Ok(bob.clone()), Ok(bob.clone()), Ok(bob)];
        let (_, events, _) = run_scripted(&fixture, SessionMode::Continuous, settings(10), script);
        assert_eq!(events.len(), 4, "{events:?}");
        assert!(matches!(events[0], SessionEvent::Marked { .. }));
        assert!(matches!(events[1], SessionEvent::AlreadyMarked { employee_id: 1, .. }));
        assert!(matches!(events[2], SessionEvent::AlreadyMarked { employee_id: 1, .. }));
        assert_eq!(events[3], SessionEvent::Stopped { reason: StopReason::Cancelled });
        assert_eq!(fixture.ledger.list_for_date(today()).unwrap().len(), 1);
    }

    #[test]
    fn test_unrecognized_and_unrostered_faces_are_unknown() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        fixture.store.begin_enrollment(2).unwrap();
        fixture.store.add_sample(2, &vertical_stripes(40, 200)).unwrap();
        attendance_core::ModelTrainer::default()
            .train_and_save(&fixture.store, &fixture.model_path)
            .unwrap();

        let script = vec![
            Ok(frame_of(&checkerboard())),
            Ok(blank_frame()),
            Ok(frame_of(&vertical_stripes(40, 200))),
        ];
        let (_, events, _) = run_scripted(&fixture, SessionMode::Continuous, settings(10), script);
        assert!(matches!(events[0], SessionEvent::Unknown { employee_id: None, distance } if distance >= 70.0));
        assert!(matches!(events[1], SessionEvent::Unknown { employee_id: Some(2), .. }));
        assert!(fixture.ledger.list_for_date(today()).unwrap().is_empty());
    }

    #[test]
    fn test_fails_after_consecutive_read_failures() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);

        let script = vec![
            Err(read_error()),
            Err(read_error()),
            Ok(blank_frame()),
            Err(read_error()),
            Err(read_error()),
            Err(read_error()),
        ];
        let (result, events, state) = run_scripted(&fixture, SessionMode::Continuous, settings(3), script);
        assert!(matches!(result, Err(SessionError::ReadFailures { failures: 3, .. })));
        assert_eq!(state, SessionState::Failed);
        assert!(matches!(events.last(), Some(SessionEvent::Failed { .. })));
    }

    #[test]
    fn test_single_shot_times_out() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        let settings = SessionSettings {
            timeout: Some(Duration::ZERO),
            ..settings(10)
        };
        let (result, events, _) = run_scripted(&fixture, SessionMode::SingleShot, settings, vec![]);
        assert_eq!(result.unwrap(), StopReason::TimedOut);
        assert_eq!(events, vec![SessionEvent::Stopped { reason: StopReason::TimedOut }]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        let cancel = CancelToken::new();
        let mut session = RecognitionSession::new(SessionMode::Continuous, settings(10), cancel.clone());
        session
            .start(|| Ok(ScriptedCamera::looping(blank_frame())), &fixture.model_path)
            .unwrap();

        assert!(session.stop());
        assert!(!session.stop());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(cancel.is_cancelled());

        let err = session
            .run(&mut WholeFrameLocator, &fixture.store, &fixture.ledger, &mut |_: SessionEvent| {})
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[test]
    fn test_missing_model_fails_without_opening_camera() {
        let fixture = Fixture::new();
        let mut session: RecognitionSession<ScriptedCamera> =
            RecognitionSession::new(SessionMode::SingleShot, settings(10), CancelToken::new());
        let mut opened = false;
        let err = session
            .start(
                || {
                    opened = true;
                    Ok(ScriptedCamera::looping(blank_frame()))
                },
                &fixture.model_path,
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::Model(ModelError::NotFound(_))));
        assert!(!opened);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!fixture.root.join("attendance").read_dir().unwrap().any(|_| true));
    }

    #[test]
    fn test_camera_unavailable_fails_start() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        let mut session: RecognitionSession<ScriptedCamera> =
            RecognitionSession::new(SessionMode::SingleShot, settings(10), CancelToken::new());
        let err = session
            .start(|| Err(CameraError::DeviceBusy("/dev/video0".into())), &fixture.model_path)
            .unwrap_err();
        assert!(matches!(err, SessionError::CameraUnavailable(CameraError::DeviceBusy(_))));
        assert_eq!(session.state(), SessionState::Failed);
    }
}

use attendance_core::{
    AttendanceLedger, AttendanceRecord, Employee, EmployeeId, FaceLocator, LedgerError, MarkOutcome, ModelTrainer,
    SampleStore, StoreError, TrainError, TrainSummary,
};
use attendance_hw::{CameraError, FrameSource};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::enroll::{EnrollError, EnrollEvent, EnrollSettings, EnrollTargets, Enrollment};
use crate::session::{CancelToken, RecognitionSession, SessionError, SessionEvent, SessionMode, SessionSettings};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera is busy with another enrollment or session")]
    CameraBusy,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("background task failed: {0}")]
    TaskFailed(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// State shared by the engine thread and its handles.
pub struct EngineContext {
    pub config: Config,
    pub store: Arc<SampleStore>,
    pub ledger: Arc<AttendanceLedger>,
    pub trainer: ModelTrainer,
}

/// Cancels a running session from outside the engine thread.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u32,
    pub mode: SessionMode,
    cancel: CancelToken,
}

impl SessionHandle {
    /// Request the session to stop. Returns `false` if a stop was already requested.
    pub fn stop(&self) -> bool {
        self.cancel.cancel()
    }
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub camera_device: String,
    pub camera_busy: bool,
    pub model_trained: bool,
    pub employees: usize,
    pub acceptance_threshold: f64,
}

/// Holds the camera claim for one request; released on drop.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::CameraBusy)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        enrollment: Enrollment,
        events: mpsc::UnboundedSender<EnrollEvent>,
        busy: BusyGuard,
    },
    Session {
        mode: SessionMode,
        cancel: CancelToken,
        started: oneshot::Sender<Result<(), SessionError>>,
        events: mpsc::UnboundedSender<SessionEvent>,
        busy: BusyGuard,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    context: Arc<EngineContext>,
    busy: Arc<AtomicBool>,
    train_lock: Arc<Mutex<()>>,
    next_session: Arc<AtomicU32>,
}

impl EngineHandle {
    /// Start capturing samples for `employee_id`.
    ///
    /// Progress arrives on the returned channel, which ends with a
    /// `Completed` or `Failed` event. Dropping the receiver cancels the capture.
    pub async fn enroll(
        &self,
        employee_id: u32,
        name: &str,
    ) -> Result<(CancelToken, mpsc::UnboundedReceiver<EnrollEvent>), EngineError> {
        let cancel = CancelToken::new();
        let settings = EnrollSettings::from_config(&self.context.config);
        let enrollment = Enrollment::new(employee_id, name, settings, cancel.clone())?;
        let busy = BusyGuard::acquire(&self.busy)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.tx
            .send(EngineRequest::Enroll {
                enrollment,
                events: events_tx,
                busy,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok((cancel, events_rx))
    }

    /// Retrain from every stored sample on the blocking pool.
    pub async fn train(&self) -> Result<TrainSummary, EngineError> {
        let context = self.context.clone();
        let train_lock = self.train_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = train_lock.lock().unwrap_or_else(|e| e.into_inner());
            context
                .trainer
                .train_and_save(&context.store, &context.config.recognizer_path())
        })
        .await
        .map_err(|e| EngineError::TaskFailed(e.to_string()))?
        .map_err(EngineError::from)
    }

    /// Start a recognition session.
    ///
    /// Returns once the model is loaded and the camera is open. Events arrive
    /// on the returned channel until a terminal `Stopped` or `Failed`.
    /// Dropping the receiver stops the session.
    pub async fn start_session(
        &self,
        mode: SessionMode,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), EngineError> {
        let busy = BusyGuard::acquire(&self.busy)?;
        let cancel = CancelToken::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.tx
            .send(EngineRequest::Session {
                mode,
                cancel: cancel.clone(),
                started: started_tx,
                events: events_tx,
                busy,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        started_rx.await.map_err(|_| EngineError::ChannelClosed)??;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Ok((SessionHandle { id, mode, cancel }, events_rx))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark `employee_id` present today without the camera.
    ///
    /// An empty `name` falls back to the roster entry; an unknown id with no
    /// name is `StoreError::NotFound`.
    pub fn mark_manual(&self, employee_id: EmployeeId, name: &str) -> Result<MarkOutcome, EngineError> {
        let name = match name.trim() {
            "" => self.context.store.employee_name(employee_id)?,
            name => name.to_string(),
        };
        let now = Local::now().naive_local();
        let outcome = self.context.ledger.mark(now.date(), employee_id, &name, now.time())?;
        tracing::info!(
            employee_id,
            name = %name,
            marked = matches!(outcome, MarkOutcome::Marked(_)),
            "manual attendance"
        );
        Ok(outcome)
    }

    pub fn attendance(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, EngineError> {
        Ok(self.context.ledger.list_for_date(date)?)
    }

    pub fn attendance_dates(&self) -> Result<Vec<NaiveDate>, EngineError> {
        Ok(self.context.ledger.list_dates()?)
    }

    pub fn roster(&self) -> Vec<Employee> {
        self.context.store.employees()
    }

    pub fn status(&self) -> EngineStatus {
        let config = &self.context.config;
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            camera_device: config.camera_device.clone(),
            camera_busy: self.is_busy(),
            model_trained: config.recognizer_path().exists(),
            employees: self.context.store.employees().len(),
            acceptance_threshold: config.acceptance_threshold,
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the detector and opens the camera through `open_camera`
/// for each enrollment or session, releasing it when the request finishes.
pub fn spawn_engine<D, S, F>(context: EngineContext, mut detector: D, open_camera: F) -> Result<EngineHandle, EngineError>
where
    D: FaceLocator + Send + 'static,
    S: FrameSource,
    F: Fn() -> Result<S, CameraError> + Send + 'static,
{
    let context = Arc::new(context);
    let train_lock = Arc::new(Mutex::new(()));
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let thread_context = context.clone();
    let thread_train_lock = train_lock.clone();
    std::thread::Builder::new()
        .name("attendance-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        enrollment,
                        events,
                        busy,
                    } => {
                        run_enroll(&thread_context, &thread_train_lock, &mut detector, &open_camera, enrollment, busy, &events);
                    }
                    EngineRequest::Session {
                        mode,
                        cancel,
                        started,
                        events,
                        busy,
                    } => {
                        run_session(&thread_context, &mut detector, &open_camera, mode, cancel, started, busy, &events);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        context,
        busy: Arc::new(AtomicBool::new(false)),
        train_lock,
        next_session: Arc::new(AtomicU32::new(1)),
    })
}

// The busy claim is released before the caller's channel closes.
fn run_enroll<D, S, F>(
    context: &EngineContext,
    train_lock: &Mutex<()>,
    detector: &mut D,
    open_camera: &F,
    enrollment: Enrollment,
    busy: BusyGuard,
    events: &mpsc::UnboundedSender<EnrollEvent>,
) where
    D: FaceLocator,
    S: FrameSource,
    F: Fn() -> Result<S, CameraError>,
{
    let cancel = enrollment.cancel_token();
    let model_path = context.config.recognizer_path();
    let targets = EnrollTargets {
        store: &context.store,
        trainer: &context.trainer,
        model_path: &model_path,
        train_lock,
    };

    let mut forward = |event: EnrollEvent| {
        if events.send(event).is_err() {
            cancel.cancel();
        }
    };
    let terminal = match enrollment.run(open_camera, detector, targets, &mut forward) {
        Ok(summary) => EnrollEvent::Completed { summary },
        Err(e) => {
            tracing::warn!(error = %e, "enrollment failed");
            EnrollEvent::Failed { error: e.to_string() }
        }
    };
    drop(busy);
    let _ = events.send(terminal);
}

#[allow(clippy::too_many_arguments)]
fn run_session<D, S, F>(
    context: &EngineContext,
    detector: &mut D,
    open_camera: &F,
    mode: SessionMode,
    cancel: CancelToken,
    started: oneshot::Sender<Result<(), SessionError>>,
    busy: BusyGuard,
    events: &mpsc::UnboundedSender<SessionEvent>,
) where
    D: FaceLocator,
    S: FrameSource,
    F: Fn() -> Result<S, CameraError>,
{
    let settings = SessionSettings::from_config(&context.config, mode);
    let mut session = RecognitionSession::new(mode, settings, cancel.clone());

    if let Err(e) = session.start(open_camera, &context.config.recognizer_path()) {
        drop(busy);
        let _ = started.send(Err(e));
        return;
    }
    if started.send(Ok(())).is_err() {
        session.stop();
        return;
    }

    // The session has released the camera by the time it emits its terminal
    // event, so the claim is dropped before that event reaches the caller.
    let mut busy = Some(busy);
    let mut forward = |event: SessionEvent| {
        if matches!(event, SessionEvent::Stopped { .. } | SessionEvent::Failed { .. }) {
            drop(busy.take());
        }
        if events.send(event).is_err() {
            cancel.cancel();
        }
    };
    if let Err(e) = session.run(detector, &context.store, &context.ledger, &mut forward) {
        tracing::warn!(error = %e, "recognition session ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StopReason;
    use crate::testing::{frame_of, horizontal_stripes, Fixture, ScriptedCamera, WholeFrameLocator};
    use attendance_hw::Frame;

    fn engine(fixture: &Fixture, frame: Frame) -> EngineHandle {
        engine_with(
            fixture,
            frame,
            Config {
                samples_per_enroll: 3,
                enroll_frame_interval_ms: 0,
                ..Config::default()
            },
        )
    }

    fn engine_with(fixture: &Fixture, frame: Frame, config: Config) -> EngineHandle {
        let config = Config {
            data_dir: fixture.root.clone(),
            read_retry_delay_ms: 0,
            ..config
        };
        let context = EngineContext {
            store: Arc::new(SampleStore::open(config.samples_dir(), config.roster_path()).unwrap()),
            ledger: Arc::new(AttendanceLedger::open(config.attendance_dir()).unwrap()),
            trainer: ModelTrainer::default(),
            config,
        };
        spawn_engine(context, WholeFrameLocator, move || Ok(ScriptedCamera::looping(frame.clone()))).unwrap()
    }

    async fn drain<T>(mut rx: mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut all = Vec::new();
        while let Some(event) = rx.recv().await {
            all.push(event);
        }
        all
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let fixture = Fixture::new();
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));

        let (_cancel, rx) = engine.enroll(7, "Alice").await.unwrap();
        let events = drain(rx).await;
        assert_eq!(events.len(), 4);
        match events.last() {
            Some(EnrollEvent::Completed { summary }) => {
                assert_eq!(summary.captured, 3);
                assert_eq!(summary.training.employees, 1);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(!engine.is_busy());

        let (handle, rx) = engine.start_session(SessionMode::SingleShot).await.unwrap();
        assert_eq!(handle.mode, SessionMode::SingleShot);
        let events = drain(rx).await;
        assert!(matches!(&events[0], SessionEvent::Marked { record } if record.employee_id == 7));
        assert_eq!(events[1], SessionEvent::Stopped { reason: StopReason::Recognized });

        let today = chrono::Local::now().date_naive();
        assert_eq!(engine.attendance(today).unwrap().len(), 1);
        assert_eq!(engine.attendance_dates().unwrap(), vec![today]);
        assert_eq!(engine.roster().len(), 1);
        assert!(engine.status().model_trained);
    }

    #[tokio::test]
    async fn test_second_camera_request_is_busy() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));

        let (handle, rx) = engine.start_session(SessionMode::Continuous).await.unwrap();
        assert!(engine.is_busy());
        assert!(matches!(engine.enroll(2, "Carol").await, Err(EngineError::CameraBusy)));
        assert!(matches!(
            engine.start_session(SessionMode::SingleShot).await,
            Err(EngineError::CameraBusy)
        ));

        assert!(handle.stop());
        assert!(!handle.stop());
        let events = drain(rx).await;
        assert_eq!(events.last(), Some(&SessionEvent::Stopped { reason: StopReason::Cancelled }));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_camera_free_when_stopped_event_arrives() {
        let fixture = Fixture::new();
        fixture.enroll(1, "Bob", &[horizontal_stripes(40, 200)]);
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));

        let (_handle, mut rx) = engine.start_session(SessionMode::SingleShot).await.unwrap();
        loop {
            match rx.recv().await {
                Some(SessionEvent::Stopped { reason }) => {
                    assert_eq!(reason, StopReason::Recognized);
                    break;
                }
                Some(_) => {}
                None => panic!("session ended without a Stopped event"),
            }
        }
        assert!(!engine.is_busy());
        let (_handle, rx) = engine.start_session(SessionMode::SingleShot).await.unwrap();
        let events = drain(rx).await;
        assert_eq!(events.last(), Some(&SessionEvent::Stopped { reason: StopReason::AlreadyMarked }));
    }

    #[tokio::test]
    async fn test_cancel_enroll_mid_capture_keeps_partial() {
        let fixture = Fixture::new();
        let config = Config {
            samples_per_enroll: 50,
            enroll_frame_interval_ms: 200,
            ..Config::default()
        };
        let engine = engine_with(&fixture, frame_of(&horizontal_stripes(40, 200)), config);

        let (cancel, mut rx) = engine.enroll(9, "Gus").await.unwrap();
        assert!(matches!(rx.recv().await, Some(EnrollEvent::Progress { captured: 1, .. })));
        assert!(cancel.cancel());

        match drain(rx).await.last() {
            Some(EnrollEvent::Completed { summary }) => {
                assert!(summary.captured < 50);
                assert_eq!(summary.target, 50);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(!engine.is_busy());
        assert_eq!(engine.roster().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_manual_once_per_day() {
        let fixture = Fixture::new();
        fixture.enroll(4, "Dora", &[horizontal_stripes(40, 200)]);
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));

        assert!(matches!(engine.mark_manual(4, ""), Ok(MarkOutcome::Marked(r)) if r.name == "Dora"));
        assert!(matches!(engine.mark_manual(4, "Dora"), Ok(MarkOutcome::AlreadyMarked(_))));
        assert!(matches!(engine.mark_manual(8, " Hal "), Ok(MarkOutcome::Marked(r)) if r.name == "Hal"));
        assert!(matches!(
            engine.mark_manual(9, "  "),
            Err(EngineError::Store(StoreError::NotFound(9)))
        ));

        let today = Local::now().date_naive();
        let ids: Vec<_> = engine.attendance(today).unwrap().iter().map(|r| r.employee_id).collect();
        assert_eq!(ids, vec![4, 8]);
    }

    #[tokio::test]
    async fn test_session_without_model_fails_to_start() {
        let fixture = Fixture::new();
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));
        let err = engine.start_session(SessionMode::SingleShot).await.unwrap_err();
        assert!(matches!(err, EngineError::Session(SessionError::Model(_))));
        assert!(!engine.is_busy());
    }

    #[tokio::test]
    async fn test_train_without_samples() {
        let fixture = Fixture::new();
        let engine = engine(&fixture, frame_of(&horizontal_stripes(40, 200)));
        let err = engine.train().await.unwrap_err();
        assert!(matches!(err, EngineError::Train(TrainError::NoSamples)));
    }
}

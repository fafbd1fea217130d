use attendance_core::{EmployeeId, MarkOutcome, ModelError, StoreError};
use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::engine::{EngineError, EngineHandle, SessionHandle};
use crate::enroll::{EnrollError, EnrollEvent};
use crate::session::{CancelToken, SessionError, SessionEvent, SessionMode};

pub const BUS_NAME: &str = "org.attendance.Attendance1";
pub const OBJECT_PATH: &str = "/org/attendance/Attendance1";

/// Repeats of an informational event for the same face are not re-signalled
/// within this window.
const REPEAT_WINDOW: Duration = Duration::from_secs(5);

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.attendance.Attendance1
/// Object path: /org/attendance/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    sessions: Arc<Mutex<HashMap<u32, SessionHandle>>>,
    enrollments: Mutex<HashMap<EmployeeId, CancelToken>>,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            enrollments: Mutex::new(HashMap::new()),
        }
    }
}

#[interface(name = "org.attendance.Attendance1")]
impl AttendanceService {
    /// Capture face samples for an employee, add them to the roster and
    /// retrain. Emits `EnrollProgress` per sample; returns a JSON summary.
    async fn enroll(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        id: u32,
        name: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, name, "enroll requested");
        let (cancel, mut events) = self.engine.enroll(id, name).await.map_err(to_fdo)?;
        self.enrollments.lock().await.insert(id, cancel);

        let result: zbus::fdo::Result<String> = async {
            while let Some(event) = events.recv().await {
                match event {
                    EnrollEvent::Progress {
                        employee_id,
                        captured,
                        target,
                    } => {
                        if let Err(e) = Self::enroll_progress(&emitter, employee_id, captured, target).await {
                            tracing::warn!(error = %e, "failed to emit EnrollProgress");
                        }
                    }
                    EnrollEvent::Completed { summary } => return to_json(&summary),
                    EnrollEvent::Failed { error } => return Err(zbus::fdo::Error::Failed(error)),
                }
            }
            Err(to_fdo(EngineError::ChannelClosed))
        }
        .await;
        self.enrollments.lock().await.remove(&id);
        result
    }

    /// Stop a running enrollment early. Samples captured so far are kept and
    /// trained on. Returns false when no enrollment for `id` is running.
    async fn cancel_enroll(&self, id: u32) -> zbus::fdo::Result<bool> {
        let cancelled = match self.enrollments.lock().await.get(&id) {
            Some(cancel) => cancel.cancel(),
            None => false,
        };
        tracing::info!(id, cancelled, "enroll cancel requested");
        Ok(cancelled)
    }

    /// Mark an employee present today without the camera. An empty name uses
    /// the roster entry. Returns the outcome as a session event JSON.
    async fn mark_manual(&self, id: u32, name: &str) -> zbus::fdo::Result<String> {
        let event = match self.engine.mark_manual(id, name).map_err(to_fdo)? {
            MarkOutcome::Marked(record) => SessionEvent::Marked { record },
            MarkOutcome::AlreadyMarked(existing) => SessionEvent::AlreadyMarked {
                employee_id: existing.employee_id,
                name: existing.name,
                first_marked_at: existing.time,
            },
        };
        to_json(&event)
    }

    /// Retrain the recognition model from every stored sample.
    async fn train(&self) -> zbus::fdo::Result<String> {
        tracing::info!("train requested");
        let summary = self.engine.train().await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Start a recognition session ("single" or "continuous") and return its
    /// handle. Events are delivered through the `SessionEvent` signal.
    async fn start_session(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
        mode: &str,
    ) -> zbus::fdo::Result<u32> {
        let mode: SessionMode = mode.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        let (handle, mut events) = self.engine.start_session(mode).await.map_err(to_fdo)?;
        let id = handle.id;
        tracing::info!(handle = id, mode = ?handle.mode, "session started");

        self.sessions.lock().await.insert(id, handle);

        let emitter = emitter.into_owned();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut repeats = RepeatFilter::new(REPEAT_WINDOW);
            while let Some(event) = events.recv().await {
                if !repeats.admit(&event, Instant::now()) {
                    continue;
                }
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode session event");
                        continue;
                    }
                };
                if let Err(e) = Self::session_event(&emitter, id, &json).await {
                    tracing::warn!(handle = id, error = %e, "failed to emit SessionEvent");
                }
            }
            sessions.lock().await.remove(&id);
            tracing::debug!(handle = id, "session event stream closed");
        });

        Ok(id)
    }

    /// Stop a running session. Returns false for unknown or already-stopping handles.
    async fn stop_session(&self, handle: u32) -> zbus::fdo::Result<bool> {
        let stopped = match self.sessions.lock().await.get(&handle) {
            Some(session) => session.stop(),
            None => false,
        };
        tracing::info!(handle, stopped, "stop requested");
        Ok(stopped)
    }

    /// Records for a date (`YYYY-MM-DD`, or `today`) as JSON.
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let records = self.engine.attendance(date).map_err(to_fdo)?;
        to_json(&records)
    }

    /// Dates with attendance files, oldest first, as JSON.
    async fn attendance_dates(&self) -> zbus::fdo::Result<String> {
        let dates = self.engine.attendance_dates().map_err(to_fdo)?;
        to_json(&dates)
    }

    /// The employee roster as JSON.
    async fn roster(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.roster())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status();
        let active: Vec<u32> = self.sessions.lock().await.keys().copied().collect();
        let mut value = serde_json::to_value(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["active_sessions"] = serde_json::json!(active);
        Ok(value.to_string())
    }

    #[zbus(signal)]
    async fn enroll_progress(emitter: &SignalEmitter<'_>, id: u32, captured: u32, target: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn session_event(emitter: &SignalEmitter<'_>, handle: u32, event_json: &str) -> zbus::Result<()>;
}

/// Suppresses repeats of `AlreadyMarked` and `Unknown` for the same face
/// within a window. A continuous session reports a face on every frame it is
/// in view; the bus only needs to hear about it occasionally.
struct RepeatFilter {
    window: Duration,
    last: HashMap<(bool, Option<EmployeeId>), Instant>,
}

impl RepeatFilter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    fn admit(&mut self, event: &SessionEvent, now: Instant) -> bool {
        let key = match event {
            SessionEvent::AlreadyMarked { employee_id, .. } => (true, Some(*employee_id)),
            SessionEvent::Unknown { employee_id, .. } => (false, *employee_id),
            _ => return true,
        };
        match self.last.get(&key) {
            Some(&at) if now.duration_since(at) < self.window => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }
}

fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    let date = date.trim();
    if date.is_empty() || date.eq_ignore_ascii_case("today") {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    match err {
        EngineError::CameraBusy => zbus::fdo::Error::LimitsExceeded(err.to_string()),
        EngineError::Enroll(EnrollError::EmptyName) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        EngineError::Session(SessionError::Model(ModelError::NotFound(_))) => zbus::fdo::Error::FileNotFound(err.to_string()),
        EngineError::Store(StoreError::NotFound(_)) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

//! Per-day attendance files.
//!
//! One CSV file per calendar date (`YYYY-MM-DD.csv`, header `ID,Name,Time`),
//! append-only, at most one row per employee.

use crate::types::{AttendanceRecord, EmployeeId};
use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance file: {0}")]
    Csv(#[from] csv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a [`AttendanceLedger::mark`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was written.
    Marked(AttendanceRecord),
    /// The employee was already marked that day; carries the existing record.
    AlreadyMarked(AttendanceRecord),
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRow {
    #[serde(rename = "ID")]
    id: EmployeeId,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Time")]
    time: NaiveTime,
}

impl LedgerRow {
    fn into_record(self, date: NaiveDate) -> AttendanceRecord {
        AttendanceRecord {
            employee_id: self.id,
            name: self.name,
            date,
            time: self.time,
        }
    }
}

/// Directory of per-day attendance files.
pub struct AttendanceLedger {
    dir: PathBuf,
    // Serializes check-then-append so a (date, employee) pair is written once.
    write_lock: Mutex<()>,
}

impl AttendanceLedger {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "opened attendance ledger");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the file holding `date`'s records.
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.csv", date.format(DATE_FORMAT)))
    }

    pub fn has_marked(&self, date: NaiveDate, employee_id: EmployeeId) -> Result<bool, LedgerError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.find(date, employee_id)?.is_some())
    }

    /// Record attendance unless the employee already has a record for `date`.
    ///
    /// `time` is stored at whole-second precision.
    pub fn mark(
        &self,
        date: NaiveDate,
        employee_id: EmployeeId,
        name: &str,
        time: NaiveTime,
    ) -> Result<MarkOutcome, LedgerError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = self.find(date, employee_id)? {
            return Ok(MarkOutcome::AlreadyMarked(existing));
        }

        let path = self.file_for(date);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;

        let row = LedgerRow {
            id: employee_id,
            name: name.to_string(),
            time: time.with_nanosecond(0).unwrap_or(time),
        };
        let mut writer = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);
        writer.serialize(&row)?;
        writer.flush()?;

        tracing::info!(employee_id, name, %date, time = %row.time, "attendance marked");
        Ok(MarkOutcome::Marked(row.into_record(date)))
    }

    /// Records for `date` in the order they were marked.
    pub fn list_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        read_rows(&self.file_for(date)).map(|rows| rows.into_iter().map(|r| r.into_record(date)).collect())
    }

    /// Every date that has an attendance file, oldest first.
    pub fn list_dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(stem, DATE_FORMAT) {
                dates.push(date);
            }
        }
        dates.sort();
        Ok(dates)
    }

    fn find(&self, date: NaiveDate, employee_id: EmployeeId) -> Result<Option<AttendanceRecord>, LedgerError> {
        Ok(read_rows(&self.file_for(date))?
            .into_iter()
            .find(|r| r.id == employee_id)
            .map(|r| r.into_record(date)))
    }
}

fn read_rows(path: &Path) -> Result<Vec<LedgerRow>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let rows = reader.deserialize::<LedgerRow>().collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

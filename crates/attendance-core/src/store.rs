//! On-disk face samples and the employee roster.
//!
//! Samples live in one directory as `User.<id>.<session>.<sequence>.png`.
//! Every enrollment opens a new session for the employee, so earlier samples
//! are kept and sequence numbers restart at 1. The roster is a CSV file with
//! an `ID,Name` header.

use crate::types::{Employee, EmployeeId, Sample};
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

const SAMPLE_PREFIX: &str = "User.";
const SAMPLE_EXTENSION: &str = ".png";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("employee {0} not found in roster")]
    NotFound(EmployeeId),
    #[error("employee name must not be empty")]
    EmptyName,
    #[error("roster: {0}")]
    Roster(#[from] csv::Error),
    #[error("sample image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct RosterRow {
    #[serde(rename = "ID")]
    id: EmployeeId,
    #[serde(rename = "Name")]
    name: String,
}

/// Where the next sample of an employee's current enrollment goes.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    session: u32,
    next_sequence: u32,
}

/// Owner of the sample set and the roster.
pub struct SampleStore {
    samples_dir: PathBuf,
    roster_path: PathBuf,
    roster: RwLock<BTreeMap<EmployeeId, String>>,
    cursors: Mutex<HashMap<EmployeeId, Cursor>>,
}

impl SampleStore {
    /// Open (and create if needed) the samples directory and load the roster.
    pub fn open(samples_dir: impl Into<PathBuf>, roster_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let samples_dir = samples_dir.into();
        let roster_path = roster_path.into();
        fs::create_dir_all(&samples_dir)?;

        let roster = read_roster(&roster_path)?;
        tracing::info!(
            samples_dir = %samples_dir.display(),
            roster = %roster_path.display(),
            employees = roster.len(),
            "opened sample store"
        );

        Ok(Self {
            samples_dir,
            roster_path,
            roster: RwLock::new(roster),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    pub fn samples_dir(&self) -> &Path {
        &self.samples_dir
    }

    /// Start a new enrollment session for `employee_id` and return its number.
    ///
    /// The session number is one past the highest already on disk for the
    /// employee, so repeated enrollments never overwrite earlier samples.
    pub fn begin_enrollment(&self, employee_id: EmployeeId) -> Result<u32, StoreError> {
        let session = self.last_session(employee_id)? + 1;
        self.cursors.lock().unwrap_or_else(|e| e.into_inner()).insert(
            employee_id,
            Cursor {
                session,
                next_sequence: 1,
            },
        );
        tracing::debug!(employee_id, session, "began enrollment session");
        Ok(session)
    }

    /// Store one face crop and return its sequence number within the current
    /// enrollment session (opening one if none is active).
    pub fn add_sample(&self, employee_id: EmployeeId, image: &GrayImage) -> Result<u32, StoreError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = match cursors.get(&employee_id) {
            Some(c) => *c,
            None => Cursor {
                session: self.last_session(employee_id)? + 1,
                next_sequence: 1,
            },
        };

        let path = self.samples_dir.join(sample_file_name(employee_id, cursor.session, cursor.next_sequence));
        image.save_with_format(&path, ImageFormat::Png)?;

        cursors.insert(
            employee_id,
            Cursor {
                session: cursor.session,
                next_sequence: cursor.next_sequence + 1,
            },
        );
        tracing::debug!(
            employee_id,
            session = cursor.session,
            sequence = cursor.next_sequence,
            width = image.width(),
            height = image.height(),
            "stored face sample"
        );
        Ok(cursor.next_sequence)
    }

    /// Every stored sample, ordered by (employee, session, sequence).
    ///
    /// Files that do not follow the naming scheme or fail to decode are
    /// skipped with a warning.
    pub fn list_samples(&self) -> Result<Vec<Sample>, StoreError> {
        let mut samples = Vec::new();

        for (path, (employee_id, session, sequence)) in self.sample_files()? {
            match image::open(&path) {
                Ok(img) => samples.push(Sample {
                    employee_id,
                    session,
                    sequence,
                    image: img.into_luma8(),
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }

        samples.sort_by_key(|s| (s.employee_id, s.session, s.sequence));
        Ok(samples)
    }

    /// Number of sample files on disk for one employee.
    pub fn sample_count(&self, employee_id: EmployeeId) -> Result<usize, StoreError> {
        Ok(self
            .sample_files()?
            .into_iter()
            .filter(|(_, (id, _, _))| *id == employee_id)
            .count())
    }

    /// Insert or rename an employee.
    ///
    /// The roster file is rewritten through a temporary file and renamed into
    /// place; in-memory readers block on the lock until the write finishes.
    pub fn upsert_employee(&self, id: EmployeeId, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }

        let mut roster = self.roster.write().unwrap_or_else(|e| e.into_inner());
        let mut updated = roster.clone();
        let previous = updated.insert(id, name.to_string());
        write_roster(&self.roster_path, &updated)?;
        *roster = updated;

        match previous {
            Some(old) => tracing::info!(id, old = %old, new = %name, "updated employee"),
            None => tracing::info!(id, name = %name, "added employee"),
        }
        Ok(())
    }

    pub fn employee_name(&self, id: EmployeeId) -> Result<String, StoreError> {
        self.roster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Whole roster, ordered by id.
    pub fn employees(&self) -> Vec<Employee> {
        self.roster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(&id, name)| Employee {
                id,
                name: name.clone(),
            })
            .collect()
    }

    fn sample_files(&self) -> Result<Vec<(PathBuf, (EmployeeId, u32, u32))>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.samples_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_sample_file_name(name) {
                Some(key) => files.push((path, key)),
                None => tracing::warn!(path = %path.display(), "ignoring file with unexpected name"),
            }
        }
        Ok(files)
    }

    fn last_session(&self, employee_id: EmployeeId) -> Result<u32, StoreError> {
        Ok(self
            .sample_files()?
            .into_iter()
            .filter(|(_, (id, _, _))| *id == employee_id)
            .map(|(_, (_, session, _))| session)
            .max()
            .unwrap_or(0))
    }
}

fn sample_file_name(employee_id: EmployeeId, session: u32, sequence: u32) -> String {
    format!("{SAMPLE_PREFIX}{employee_id}.{session}.{sequence}{SAMPLE_EXTENSION}")
}

/// Parse `User.<id>.<session>.<sequence>.png`.
fn parse_sample_file_name(name: &str) -> Option<(EmployeeId, u32, u32)> {
    let stem = name.strip_prefix(SAMPLE_PREFIX)?.strip_suffix(SAMPLE_EXTENSION)?;
    let mut parts = stem.split('.');
    let id = parts.next()?.parse().ok()?;
    let session = parts.next()?.parse().ok()?;
    let sequence = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((id, session, sequence))
}

fn read_roster(path: &Path) -> Result<BTreeMap<EmployeeId, String>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut roster = BTreeMap::new();
    for row in reader.deserialize::<RosterRow>() {
        let row = row?;
        roster.insert(row.id, row.name);
    }
    Ok(roster)
}

fn write_roster(path: &Path, roster: &BTreeMap<EmployeeId, String>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        if roster.is_empty() {
            writer.write_record(["ID", "Name"])?;
        }
        for (&id, name) in roster {
            writer.serialize(RosterRow {
                id,
                name: name.clone(),
            })?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

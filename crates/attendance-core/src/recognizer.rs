//! LBPH face recognition model.
//!
//! Holds one grid histogram per training sample and classifies a probe crop by
//! nearest-neighbour chi-square distance. The model never accepts or rejects a
//! face on its own; callers compare the distance against their threshold.

use crate::lbp::{self, LbpError, LBP_BINS, MAX_GRID};
use crate::types::{ChiSquareMatcher, EmployeeId, LabeledHistogram, Matcher, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_GRID_X: u32 = 8;
pub const DEFAULT_GRID_Y: u32 = 8;

const ARTIFACT_FORMAT: &str = "lbph-v1";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("recognition model not found at {0} — train before recognizing")]
    NotFound(String),
    #[error("recognition model at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("cannot classify face: {0}")]
    Crop(#[from] LbpError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A trained LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    format: String,
    grid_x: u32,
    grid_y: u32,
    gallery: Vec<LabeledHistogram>,
}

impl LbphModel {
    pub(crate) fn new(grid_x: u32, grid_y: u32, gallery: Vec<LabeledHistogram>) -> Self {
        Self {
            format: ARTIFACT_FORMAT.to_string(),
            grid_x,
            grid_y,
            gallery,
        }
    }

    pub fn grid(&self) -> (u32, u32) {
        (self.grid_x, self.grid_y)
    }

    /// Number of training histograms.
    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    /// Distinct employee ids the model can predict.
    pub fn labels(&self) -> BTreeSet<EmployeeId> {
        self.gallery.iter().map(|g| g.employee_id).collect()
    }

    /// Classify a face crop, returning the closest employee and its distance.
    pub fn classify(&self, crop: &GrayImage) -> Result<Prediction, ModelError> {
        let probe = lbp::spatial_histogram(crop, self.grid_x, self.grid_y)?;
        ChiSquareMatcher
            .nearest(&probe, &self.gallery)
            // A loaded or trained model always has at least one entry.
            .ok_or_else(|| ModelError::Corrupt {
                path: "<memory>".to_string(),
                reason: "empty gallery".to_string(),
            })
    }

    /// Write the model to `path`.
    ///
    /// The artifact is written beside the target and renamed into place, so a
    /// concurrent `load` sees either the old or the new model.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        tracing::info!(
            path = %path.display(),
            histograms = self.gallery.len(),
            employees = self.labels().len(),
            "saved recognition model"
        );
        Ok(())
    }

    /// Load a model previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModelError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| ModelError::Corrupt {
            path: path.display().to_string(),
            reason,
        };

        let model: LbphModel = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        model.validate().map_err(corrupt)?;

        tracing::info!(
            path = %path.display(),
            histograms = model.gallery.len(),
            "loaded recognition model"
        );
        Ok(model)
    }

    fn validate(&self) -> Result<(), String> {
        if self.format != ARTIFACT_FORMAT {
            return Err(format!("unsupported format {:?}", self.format));
        }
        if self.grid_x == 0 || self.grid_y == 0 || self.grid_x > MAX_GRID || self.grid_y > MAX_GRID {
            return Err(format!("invalid grid {}x{}", self.grid_x, self.grid_y));
        }
        if self.gallery.is_empty() {
            return Err("model has no training histograms".to_string());
        }
        let expected = (self.grid_x * self.grid_y) as usize * LBP_BINS;
        if let Some(bad) = self.gallery.iter().find(|g| g.histogram.len() != expected) {
            return Err(format!(
                "histogram for employee {} has {} bins, expected {expected}",
                bad.employee_id,
                bad.histogram.len()
            ));
        }
        Ok(())
    }
}

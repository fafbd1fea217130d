//! Builds an [`LbphModel`] from the full sample set.

use crate::lbp::{self, LbpError};
use crate::recognizer::{LbphModel, ModelError, DEFAULT_GRID_X, DEFAULT_GRID_Y};
use crate::store::{SampleStore, StoreError};
use crate::types::{EmployeeId, LabeledHistogram, Sample};
use image::GrayImage;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no face samples to train on — enroll at least one employee first")]
    NoSamples,
    #[error("training failed on sample {sequence} (session {session}) of employee {employee_id}: {source}")]
    TrainingFailed {
        employee_id: EmployeeId,
        session: u32,
        sequence: u32,
        #[source]
        source: LbpError,
    },
    #[error("sample store: {0}")]
    Store(#[from] StoreError),
    #[error("saving model: {0}")]
    Model(#[from] ModelError),
}

/// Result of a train-and-save run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub samples: usize,
    pub employees: usize,
}

/// LBPH trainer. Every call rebuilds the model from scratch.
#[derive(Debug, Clone)]
pub struct ModelTrainer {
    grid_x: u32,
    grid_y: u32,
}

impl Default for ModelTrainer {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_X, DEFAULT_GRID_Y)
    }
}

impl ModelTrainer {
    pub fn new(grid_x: u32, grid_y: u32) -> Self {
        Self { grid_x, grid_y }
    }

    /// Smallest crop (width, height) this trainer can turn into a histogram.
    pub fn min_sample_size(&self) -> (u32, u32) {
        (self.grid_x + 2, self.grid_y + 2)
    }

    /// Whether `image` is large enough to train on.
    pub fn accepts(&self, image: &GrayImage) -> bool {
        let (min_w, min_h) = self.min_sample_size();
        image.width() >= min_w && image.height() >= min_h
    }

    /// Fit a model to `samples`.
    pub fn train(&self, samples: &[Sample]) -> Result<LbphModel, TrainError> {
        if samples.is_empty() {
            return Err(TrainError::NoSamples);
        }

        let gallery = samples
            .iter()
            .map(|s| {
                lbp::spatial_histogram(&s.image, self.grid_x, self.grid_y)
                    .map(|histogram| LabeledHistogram {
                        employee_id: s.employee_id,
                        histogram,
                    })
                    .map_err(|source| TrainError::TrainingFailed {
                        employee_id: s.employee_id,
                        session: s.session,
                        sequence: s.sequence,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            samples = gallery.len(),
            grid_x = self.grid_x,
            grid_y = self.grid_y,
            "trained LBPH model"
        );

        Ok(LbphModel::new(self.grid_x, self.grid_y, gallery))
    }

    /// Read every stored sample, train, and persist the model at `model_path`.
    pub fn train_and_save(&self, store: &SampleStore, model_path: &Path) -> Result<TrainSummary, TrainError> {
        let samples = store.list_samples()?;
        let model = self.train(&samples)?;
        model.save(model_path)?;

        let employees: BTreeSet<EmployeeId> = samples.iter().map(|s| s.employee_id).collect();
        Ok(TrainSummary {
            samples: samples.len(),
            employees: employees.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::tests::{horizontal_stripes, vertical_stripes};

    #[test]
    fn test_train_empty_is_no_samples() {
        let err = ModelTrainer::default().train(&[]).unwrap_err();
        assert!(matches!(err, TrainError::NoSamples));
    }

    #[test]
    fn test_train_tiny_sample_fails_with_context() {
        let samples = vec![
            Sample { employee_id: 4, session: 1, sequence: 1, image: horizontal_stripes(40, 40, 0, 255) },
            Sample { employee_id: 4, session: 1, sequence: 2, image: GrayImage::new(4, 4) },
        ];
        let err = ModelTrainer::default().train(&samples).unwrap_err();
        match err {
            TrainError::TrainingFailed { employee_id, sequence, .. } => {
                assert_eq!(employee_id, 4);
                assert_eq!(sequence, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_accepts_matches_grid() {
        let trainer = ModelTrainer::default();
        assert_eq!(trainer.min_sample_size(), (10, 10));
        assert!(trainer.accepts(&GrayImage::new(10, 12)));
        assert!(!trainer.accepts(&GrayImage::new(9, 40)));
    }

    #[test]
    fn test_train_keeps_every_sample() {
        let samples = vec![
            Sample { employee_id: 1, session: 1, sequence: 1, image: horizontal_stripes(40, 40, 0, 255) },
            Sample { employee_id: 1, session: 2, sequence: 1, image: horizontal_stripes(48, 40, 0, 255) },
            Sample { employee_id: 9, session: 1, sequence: 1, image: vertical_stripes(40, 40, 0, 255) },
        ];
        let model = ModelTrainer::new(4, 4).train(&samples).unwrap();
        assert_eq!(model.len(), 3);
        assert_eq!(model.grid(), (4, 4));
        assert_eq!(model.labels().into_iter().collect::<Vec<_>>(), vec![1, 9]);
    }

    #[test]
    fn test_train_and_save_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path().join("samples"), dir.path().join("roster.csv")).unwrap();
        let model_path = dir.path().join("recognizer.json");
        let err = ModelTrainer::default().train_and_save(&store, &model_path).unwrap_err();
        assert!(matches!(err, TrainError::NoSamples));
        assert!(!model_path.exists());
    }

    #[test]
    fn test_train_and_save_writes_loadable_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path().join("samples"), dir.path().join("roster.csv")).unwrap();
        store.add_sample(1, &horizontal_stripes(40, 40, 20, 220)).unwrap();
        store.add_sample(1, &horizontal_stripes(42, 40, 20, 220)).unwrap();
        store.add_sample(2, &vertical_stripes(40, 40, 20, 220)).unwrap();

        let model_path = dir.path().join("model/recognizer.json");
        let summary = ModelTrainer::default().train_and_save(&store, &model_path).unwrap();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.employees, 2);

        let model = LbphModel::load(&model_path).unwrap();
        let p = model.classify(&vertical_stripes(44, 44, 20, 220)).unwrap();
        assert_eq!(p.employee_id, 2);
    }
}

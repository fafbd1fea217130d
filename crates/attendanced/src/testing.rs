//! Scripted camera and detector used by the daemon's tests.

use attendance_core::{
    AttendanceLedger, BoundingBox, DetectorError, EmployeeId, FaceLocator, ModelTrainer, SampleStore,
};
use attendance_hw::{CameraError, Frame, FrameSource};
use image::{GrayImage, Luma};
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::session::CancelToken;

pub(crate) const SIDE: u32 = 48;

pub(crate) fn horizontal_stripes(dark: u8, bright: u8) -> GrayImage {
    GrayImage::from_fn(SIDE, SIDE, |_, y| Luma([if y % 2 == 0 { dark } else { bright }]))
}

pub(crate) fn vertical_stripes(dark: u8, bright: u8) -> GrayImage {
    GrayImage::from_fn(SIDE, SIDE, |x, _| Luma([if x % 2 == 0 { dark } else { bright }]))
}

pub(crate) fn checkerboard() -> GrayImage {
    GrayImage::from_fn(SIDE, SIDE, |x, y| Luma([if (x + y) % 2 == 0 { 30 } else { 220 }]))
}

pub(crate) fn frame_of(image: &GrayImage) -> Frame {
    Frame::new(image.as_raw().clone(), image.width(), image.height(), 0)
}

/// A uniform frame; [`WholeFrameLocator`] finds no face in it.
pub(crate) fn blank_frame() -> Frame {
    Frame::new(vec![0; (SIDE * SIDE) as usize], SIDE, SIDE, 0)
}

pub(crate) fn read_error() -> CameraError {
    CameraError::CaptureFailed("scripted failure".into())
}

/// Plays back a fixed list of reads. Once the script runs out it returns
/// `idle` forever, cancelling `on_exhausted` if set.
pub(crate) struct ScriptedCamera {
    script: VecDeque<Result<Frame, CameraError>>,
    idle: Frame,
    on_exhausted: Option<CancelToken>,
}

impl ScriptedCamera {
    pub(crate) fn new(script: Vec<Result<Frame, CameraError>>, on_exhausted: CancelToken) -> Self {
        Self {
            script: script.into(),
            idle: blank_frame(),
            on_exhausted: Some(on_exhausted),
        }
    }

    /// Returns `frame` on every read.
    pub(crate) fn looping(frame: Frame) -> Self {
        Self {
            script: VecDeque::new(),
            idle: frame,
            on_exhausted: None,
        }
    }
}

impl FrameSource for ScriptedCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        match self.script.pop_front() {
            Some(step) => step,
            None => {
                if let Some(cancel) = &self.on_exhausted {
                    cancel.cancel();
                }
                Ok(self.idle.clone())
            }
        }
    }
}

/// Reports one face covering the whole frame unless the frame is uniform.
pub(crate) struct WholeFrameLocator;

impl FaceLocator for WholeFrameLocator {
    fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let Some(&first) = frame.first() else {
            return Ok(Vec::new());
        };
        if frame.iter().all(|&b| b == first) {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 0.9,
        }])
    }
}

/// Temporary data directory with an open store and ledger.
pub(crate) struct Fixture {
    pub(crate) _dir: tempfile::TempDir,
    pub(crate) root: PathBuf,
    pub(crate) store: SampleStore,
    pub(crate) ledger: AttendanceLedger,
    pub(crate) model_path: PathBuf,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = SampleStore::open(root.join("samples"), root.join("roster.csv")).unwrap();
        let ledger = AttendanceLedger::open(root.join("attendance")).unwrap();
        Self {
            model_path: root.join("model/recognizer.json"),
            root,
            store,
            ledger,
            _dir: dir,
        }
    }

    /// Store `images` as one enrollment of `id`, register `name`, and retrain.
    pub(crate) fn enroll(&self, id: EmployeeId, name: &str, images: &[GrayImage]) {
        self.store.begin_enrollment(id).unwrap();
        for image in images {
            self.store.add_sample(id, image).unwrap();
        }
        self.store.upsert_employee(id, name).unwrap();
        ModelTrainer::default().train_and_save(&self.store, &self.model_path).unwrap();
    }
}

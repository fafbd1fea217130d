use chrono::{NaiveDate, NaiveTime};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::lbp::Histogram;

/// Externally assigned employee identifier.
pub type EmployeeId = u32;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Snap the box to whole pixels and clamp it to a `frame_width`×`frame_height` frame.
    ///
    /// Returns `None` when no part of the box lies inside the frame.
    pub fn to_rect(&self, frame_width: u32, frame_height: u32) -> Option<FaceRect> {
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = (self.x + self.width).ceil().min(frame_width as f32);
        let y1 = (self.y + self.height).ceil().min(frame_height as f32);

        // Negated comparison also rejects NaN coordinates.
        if !(x1 > x0 && y1 > y0) {
            return None;
        }

        Some(FaceRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Integer, axis-aligned face rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    /// Copy this rectangle out of a row-major 8-bit grayscale frame.
    ///
    /// The crop keeps the rectangle's exact dimensions. Returns `None` if the
    /// rectangle does not fit in the frame or the buffer is too short.
    pub fn crop(&self, frame: &[u8], frame_width: u32, frame_height: u32) -> Option<GrayImage> {
        let (fw, fh) = (frame_width as usize, frame_height as usize);
        let (x, y) = (self.x as usize, self.y as usize);
        let (w, h) = (self.width as usize, self.height as usize);

        if w == 0 || h == 0 || x + w > fw || y + h > fh || frame.len() < fw * fh {
            return None;
        }

        let mut pixels = Vec::with_capacity(w * h);
        for row in y..y + h {
            let start = row * fw + x;
            pixels.extend_from_slice(&frame[start..start + w]);
        }
        GrayImage::from_raw(self.width, self.height, pixels)
    }
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
}

/// A stored face crop belonging to one employee.
#[derive(Debug, Clone)]
pub struct Sample {
    pub employee_id: EmployeeId,
    /// Enrollment session that captured this sample.
    pub session: u32,
    /// Position within the enrollment session, starting at 1.
    pub sequence: u32,
    pub image: GrayImage,
}

/// One attendance mark. At most one exists per (date, employee).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub employee_id: EmployeeId,
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// Model output for one face crop. Lower distance means a closer match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub employee_id: EmployeeId,
    pub distance: f64,
}

impl Prediction {
    /// Whether the prediction clears an acceptance threshold (strictly below).
    pub fn is_accepted(&self, threshold: f64) -> bool {
        self.distance < threshold
    }
}

/// A training histogram tagged with its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledHistogram {
    pub employee_id: EmployeeId,
    pub histogram: Histogram,
}

/// Strategy for comparing a probe histogram against a gallery of training histograms.
pub trait Matcher {
    fn nearest(&self, probe: &Histogram, gallery: &[LabeledHistogram]) -> Option<Prediction>;
}

/// Nearest-neighbour matcher using the chi-square distance.
///
/// Ties resolve to the earliest gallery entry, so results are deterministic.
pub struct ChiSquareMatcher;

impl Matcher for ChiSquareMatcher {
    fn nearest(&self, probe: &Histogram, gallery: &[LabeledHistogram]) -> Option<Prediction> {
        let mut best: Option<Prediction> = None;

        for entry in gallery {
            let distance = probe.chi_square(&entry.histogram);
            let closer = match best {
                None => true,
                Some(prev) => distance < prev.distance,
            };
            if closer {
                best = Some(Prediction {
                    employee_id: entry.employee_id,
                    distance,
                });
            }
        }

        best
    }
}

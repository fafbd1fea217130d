//! Local binary patterns (radius 1, 8 neighbours) and grid-cell histograms.
//!
//! Each pixel is encoded by comparing its eight neighbours against it, one bit
//! per neighbour set when the neighbour is not darker than the centre. The
//! code image is split into a `grid_x`×`grid_y` grid; each cell contributes a
//! 256-bin histogram normalised to sum to 1, and the cells are concatenated.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of distinct 8-neighbour codes.
pub const LBP_BINS: usize = 256;

/// Largest grid dimension a histogram can be built for.
pub const MAX_GRID: u32 = 64;

/// Upper bound on a histogram's length, for a `MAX_GRID`×`MAX_GRID` grid.
pub const MAX_HISTOGRAM_LEN: usize = (MAX_GRID * MAX_GRID) as usize * LBP_BINS;

/// Neighbour offsets (dx, dy) in bit order, most significant bit first,
/// walking clockwise from the top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LbpError {
    #[error("{width}x{height} crop is too small for a {grid_x}x{grid_y} LBP grid")]
    TooSmall {
        width: u32,
        height: u32,
        grid_x: u32,
        grid_y: u32,
    },
}

/// Concatenated per-cell LBP histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SparseHistogram", try_from = "SparseHistogram")]
pub struct Histogram {
    bins: Vec<f32>,
}

impl Histogram {
    pub fn from_bins(bins: Vec<f32>) -> Self {
        Self { bins }
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Chi-square distance: `sum(2 * (a - b)^2 / (a + b))` over non-empty bins.
    ///
    /// Zero for identical histograms; bounded by `4 * cells` for normalised inputs.
    pub fn chi_square(&self, other: &Histogram) -> f64 {
        self.bins
            .iter()
            .zip(other.bins.iter())
            .map(|(&a, &b)| {
                let (a, b) = (a as f64, b as f64);
                let sum = a + b;
                if sum > f64::EPSILON {
                    2.0 * (a - b).powi(2) / sum
                } else {
                    0.0
                }
            })
            .sum()
    }
}

/// On-disk form of a histogram: only non-zero bins are written.
#[derive(Serialize, Deserialize)]
struct SparseHistogram {
    len: usize,
    bins: Vec<(u32, f32)>,
}

impl From<Histogram> for SparseHistogram {
    fn from(hist: Histogram) -> Self {
        let bins = hist
            .bins
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (i as u32, v))
            .collect();
        Self { len: hist.bins.len(), bins }
    }
}

impl TryFrom<SparseHistogram> for Histogram {
    type Error = String;

    fn try_from(sparse: SparseHistogram) -> Result<Self, Self::Error> {
        if sparse.len > MAX_HISTOGRAM_LEN {
            return Err(format!("histogram length {} exceeds {MAX_HISTOGRAM_LEN}", sparse.len));
        }
        let mut bins = vec![0.0f32; sparse.len];
        for (idx, value) in sparse.bins {
            let slot = bins
                .get_mut(idx as usize)
                .ok_or_else(|| format!("bin {idx} out of range for length {}", sparse.len))?;
            if !value.is_finite() || value < 0.0 {
                return Err(format!("bin {idx} has invalid weight {value}"));
            }
            *slot = value;
        }
        Ok(Self { bins })
    }
}

/// Compute the LBP code image. Border pixels have no full neighbourhood, so the
/// result is two pixels narrower and shorter than the input.
pub fn lbp_codes(img: &GrayImage) -> Option<GrayImage> {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return None;
    }

    let mut codes = GrayImage::new(w - 2, h - 2);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = img.get_pixel(x, y)[0];
            let mut code = 0u8;
            for (dx, dy) in NEIGHBOURS {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                code = (code << 1) | u8::from(img.get_pixel(nx, ny)[0] >= center);
            }
            codes.put_pixel(x - 1, y - 1, image::Luma([code]));
        }
    }
    Some(codes)
}

/// Build the concatenated grid histogram for one face crop.
pub fn spatial_histogram(img: &GrayImage, grid_x: u32, grid_y: u32) -> Result<Histogram, LbpError> {
    let too_small = || LbpError::TooSmall {
        width: img.width(),
        height: img.height(),
        grid_x,
        grid_y,
    };

    let codes = lbp_codes(img).ok_or_else(too_small)?;
    if grid_x == 0 || grid_y == 0 {
        return Err(too_small());
    }
    let cell_w = codes.width() / grid_x;
    let cell_h = codes.height() / grid_y;
    if cell_w == 0 || cell_h == 0 {
        return Err(too_small());
    }

    let cell_pixels = (cell_w * cell_h) as f32;
    let mut bins = vec![0.0f32; (grid_x * grid_y) as usize * LBP_BINS];

    for row in 0..grid_y {
        for col in 0..grid_x {
            let offset = (row * grid_x + col) as usize * LBP_BINS;
            let cell = &mut bins[offset..offset + LBP_BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes.get_pixel(x, y)[0] as usize] += 1.0;
                }
            }
            for v in cell.iter_mut() {
                *v /= cell_pixels;
            }
        }
    }

    Ok(Histogram { bins })
}

//! Local Binary Pattern Histograms.
//!
//! Each sample is reduced to a spatial histogram of extended (circular,
//! bilinearly interpolated) local binary patterns. Training only ever appends
//! histograms, so it is incremental by construction.

use super::{check_labels, mark_persisted, ModelError};
use crate::codec::{decode, encode_f32, encode_i32};
use crate::store::{ModelSnapshot, StoredSample};
use crate::types::{IdentityId, Prediction, Sample, SampleStatus};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const STATE_PARAMS: &str = "params";

/// Largest supported neighbour count; histograms have 2^neighbors bins per cell.
pub const MAX_NEIGHBORS: u32 = 16;

/// Map a strictness in [0, 1] to a chi-square distance threshold.
///
/// Logistic curve from 150 (lenient) down to 30 (strict); 0.5 gives 90.
pub fn threshold_for_strictness(strictness: f64) -> f64 {
    let s = strictness.clamp(0.0, 1.0);
    30.0 + 120.0 / (1.0 + (8.0 * s - 4.0).exp())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.radius == 0 {
            return Err(ModelError::InvalidParameters("radius must be at least 1".into()));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ModelError::InvalidParameters(format!(
                "neighbors must be in 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(ModelError::InvalidParameters("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    /// Number of histogram bins per cell.
    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of every descriptor produced with these parameters.
    pub fn descriptor_len(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize * self.bins()
    }

    fn to_state(self) -> Array2<i32> {
        Array2::from_shape_vec(
            (1, 4),
            vec![
                self.radius as i32,
                self.neighbors as i32,
                self.grid_x as i32,
                self.grid_y as i32,
            ],
        )
        .unwrap_or_else(|_| Array2::zeros((1, 4)))
    }

    fn from_state(state: &Array2<i32>) -> Option<Self> {
        let values: Vec<i32> = state.iter().copied().collect();
        let [radius, neighbors, grid_x, grid_y] = values.as_slice() else {
            return None;
        };
        let params = Self {
            radius: u32::try_from(*radius).ok()?,
            neighbors: u32::try_from(*neighbors).ok()?,
            grid_x: u32::try_from(*grid_x).ok()?,
            grid_y: u32::try_from(*grid_y).ok()?,
        };
        params.validate().ok().map(|_| params)
    }
}

/// Extended LBP codes of `src`. The output is (rows - 2r) × (cols - 2r).
fn elbp(src: &Array2<f32>, radius: usize, neighbors: usize) -> Array2<u32> {
    let (rows, cols) = src.dim();
    if rows <= 2 * radius || cols <= 2 * radius {
        return Array2::zeros((0, 0));
    }
    let mut dst = Array2::<u32>::zeros((rows - 2 * radius, cols - 2 * radius));
    let r = radius as f64;

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f64 / neighbors as f64;
        let x = r * angle.cos();
        let y = -r * angle.sin();
        let (fx, fy) = (x.floor(), y.floor());
        let (cx, cy) = (x.ceil(), y.ceil());
        let (tx, ty) = (x - fx, y - fy);
        let w1 = ((1.0 - tx) * (1.0 - ty)) as f32;
        let w2 = (tx * (1.0 - ty)) as f32;
        let w3 = ((1.0 - tx) * ty) as f32;
        let w4 = (tx * ty) as f32;
        let (fx, fy, cx, cy) = (fx as isize, fy as isize, cx as isize, cy as isize);

        for i in radius..rows - radius {
            for j in radius..cols - radius {
                let at = |dy: isize, dx: isize| {
                    src[[(i as isize + dy) as usize, (j as isize + dx) as usize]]
                };
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = src[[i, j]];
                if t > center || (t - center).abs() < f32::EPSILON {
                    dst[[i - radius, j - radius]] |= 1 << n;
                }
            }
        }
    }
    dst
}

/// Concatenated per-cell histograms, each normalised by its cell's pixel count.
fn spatial_histogram(codes: &Array2<u32>, bins: usize, grid_x: usize, grid_y: usize) -> Array1<f32> {
    let (rows, cols) = codes.dim();
    let width = cols / grid_x;
    let height = rows / grid_y;
    let mut out = Array1::<f32>::zeros(grid_x * grid_y * bins);

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let cell = codes.slice(s![gy * height..(gy + 1) * height, gx * width..(gx + 1) * width]);
            let total = cell.len();
            if total == 0 {
                continue;
            }
            let offset = (gy * grid_x + gx) * bins;
            for &code in cell.iter() {
                out[offset + code as usize] += 1.0;
            }
            let mut hist = out.slice_mut(s![offset..offset + bins]);
            hist /= total as f32;
        }
    }
    out
}

/// Spatial LBP histogram of a grayscale image, as a 1×len row.
pub fn compute_descriptor(image: &Array2<f32>, params: &LbphParams) -> Array2<f32> {
    let codes = elbp(image, params.radius as usize, params.neighbors as usize);
    let hist = spatial_histogram(
        &codes,
        params.bins(),
        params.grid_x as usize,
        params.grid_y as usize,
    );
    let len = hist.len();
    hist.into_shape_with_order((1, len))
        .unwrap_or_else(|_| Array2::zeros((1, len)))
}

/// Chi-square distance, alternative form: 2·Σ (a−b)² / (a+b).
pub fn chi_square(a: &Array2<f32>, b: &Array2<f32>) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&a, &b)| {
            let (a, b) = (f64::from(a), f64::from(b));
            let denom = a + b;
            if denom.abs() > f64::EPSILON {
                (a - b) * (a - b) / denom
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}

#[derive(Debug, Clone)]
pub struct LbphModel {
    params: LbphParams,
    samples: Vec<Sample<Array2<f32>>>,
}

impl Default for LbphModel {
    fn default() -> Self {
        Self {
            params: LbphParams::default(),
            samples: Vec::new(),
        }
    }
}

impl LbphModel {
    pub fn new(params: LbphParams) -> Result<Self, ModelError> {
        params.validate()?;
        Ok(Self {
            params,
            samples: Vec::new(),
        })
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample<Array2<f32>>] {
        &self.samples
    }

    pub fn labels(&self) -> Vec<IdentityId> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Compute and append one histogram per image.
    pub fn train(
        &mut self,
        images: &[Array2<f32>],
        labels: &[IdentityId],
        context: &str,
        preserve_existing: bool,
    ) -> Result<(), ModelError> {
        check_labels(images.len(), labels)?;
        if images.is_empty() && (!preserve_existing || self.samples.is_empty()) {
            return Err(ModelError::EmptyTrainingSet);
        }

        let descriptors: Vec<Array2<f32>> = images
            .iter()
            .map(|image| compute_descriptor(image, &self.params))
            .collect();

        if !preserve_existing {
            self.samples.clear();
        }
        self.samples.extend(
            descriptors
                .into_iter()
                .zip(labels)
                .map(|(hist, &label)| Sample::new(hist, label, context)),
        );
        tracing::debug!(samples = self.samples.len(), "lbph histograms updated");
        Ok(())
    }

    /// Stored histogram closest to `image` by chi-square distance.
    pub fn predict(&self, image: &Array2<f32>) -> Result<Prediction, ModelError> {
        if self.samples.is_empty() {
            return Err(ModelError::ModelNotTrained);
        }
        let query = compute_descriptor(image, &self.params);

        let mut best: Option<Prediction> = None;
        for sample in &self.samples {
            let distance = chi_square(&sample.feature, &query);
            if best.map_or(true, |b| distance < b.score) {
                best = Some(Prediction {
                    label: sample.label,
                    score: distance,
                });
            }
        }
        best.ok_or(ModelError::ModelNotTrained)
    }

    pub fn pending_snapshot(&self) -> ModelSnapshot {
        let samples = self
            .samples
            .iter()
            .filter(|s| !s.is_persisted())
            .map(|s| StoredSample {
                row_id: None,
                label: s.label,
                context: s.context.clone(),
                feature: encode_f32(&s.feature),
            })
            .collect();
        ModelSnapshot {
            samples,
            state: vec![(STATE_PARAMS.to_string(), encode_i32(&self.params.to_state()))],
        }
    }

    pub fn mark_persisted(&mut self, row_ids: &[i64]) {
        mark_persisted(&mut self.samples, row_ids);
    }

    /// Rebuild from a snapshot. Stored parameters take precedence over `params`
    /// because the histograms were computed with them.
    pub fn restore(params: LbphParams, snapshot: ModelSnapshot) -> Result<Self, ModelError> {
        let params = match snapshot.state(STATE_PARAMS) {
            Some(blob) => {
                let state = decode(blob)?.into_i32()?;
                LbphParams::from_state(&state).unwrap_or(params)
            }
            None => params,
        };
        let mut model = Self::new(params)?;
        let expected = params.descriptor_len();

        for stored in &snapshot.samples {
            let feature = decode(&stored.feature)?.into_f32()?;
            if feature.len() != expected {
                tracing::warn!(
                    row_id = ?stored.row_id,
                    expected,
                    actual = feature.len(),
                    "skipping lbph histogram with unexpected length"
                );
                continue;
            }
            model.samples.push(Sample {
                feature,
                label: stored.label,
                status: SampleStatus::from_row_id(stored.row_id),
                context: stored.context.clone(),
            });
        }
        Ok(model)
    }
}

//! Eigenfaces and Fisherfaces.
//!
//! Raw samples accumulate across training calls, but the projection basis is
//! refit from scratch over all of them every time. The PCA step decomposes an
//! n×n Gram matrix, so each training call costs O(n²·d + n³) for n samples of
//! d pixels; this is the scaling limit for large galleries.

use super::{check_labels, mark_persisted, ModelError};
use crate::codec::{decode, encode_f32};
use crate::linalg::{euclidean, inverse_sqrt, pca, row_mean, symmetric_eigen};
use crate::preprocess::resize_nearest;
use crate::store::{ModelSnapshot, StoredSample};
use crate::types::{IdentityId, Prediction, Sample, SampleStatus};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubspaceMethod {
    /// PCA.
    Eigen,
    /// PCA followed by LDA.
    Fisher,
}

#[derive(Debug, Clone)]
pub struct SubspaceModel {
    method: SubspaceMethod,
    /// Eigenfaces component cap; `None` keeps up to one component per sample.
    max_components: Option<usize>,
    samples: Vec<Sample<Array2<f32>>>,
    mean: Array1<f64>,
    /// d×k projection basis, one component per column.
    basis: Array2<f64>,
    projections: Vec<Array1<f64>>,
}

impl SubspaceModel {
    pub fn eigenfaces(max_components: Option<usize>) -> Self {
        Self::new(SubspaceMethod::Eigen, max_components)
    }

    pub fn fisherfaces() -> Self {
        Self::new(SubspaceMethod::Fisher, None)
    }

    fn new(method: SubspaceMethod, max_components: Option<usize>) -> Self {
        Self {
            method,
            max_components,
            samples: Vec::new(),
            mean: Array1::zeros(0),
            basis: Array2::zeros((0, 0)),
            projections: Vec::new(),
        }
    }

    pub fn method(&self) -> SubspaceMethod {
        self.method
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        !self.projections.is_empty()
    }

    pub fn samples(&self) -> &[Sample<Array2<f32>>] {
        &self.samples
    }

    pub fn labels(&self) -> Vec<IdentityId> {
        self.samples.iter().map(|s| s.label).collect()
    }

    pub fn projections(&self) -> &[Array1<f64>] {
        &self.projections
    }

    /// Number of retained subspace dimensions.
    pub fn components(&self) -> usize {
        self.basis.ncols()
    }

    /// rows×cols every stored sample has been resized to.
    pub fn sample_shape(&self) -> Option<(usize, usize)> {
        self.samples.first().map(|s| s.feature.dim())
    }

    /// Append samples and refit the basis over everything accumulated.
    ///
    /// On error the model is left exactly as it was.
    pub fn train(
        &mut self,
        images: Vec<Array2<f32>>,
        labels: &[IdentityId],
        context: &str,
        preserve_existing: bool,
    ) -> Result<(), ModelError> {
        check_labels(images.len(), labels)?;

        let existing: &[Sample<Array2<f32>>] = if preserve_existing { &self.samples } else { &[] };
        if existing.is_empty() && images.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        if images.is_empty() && self.is_trained() {
            return Ok(());
        }

        let shape = existing
            .first()
            .map(|s| s.feature.dim())
            .or_else(|| images.first().map(|m| m.dim()))
            .ok_or(ModelError::EmptyTrainingSet)?;
        if shape.0 == 0 || shape.1 == 0 {
            return Err(ModelError::InvalidParameters(format!(
                "empty sample image {}x{}",
                shape.1, shape.0
            )));
        }

        let fresh: Vec<Array2<f32>> = images
            .iter()
            .map(|m| resize_nearest(m, shape.0, shape.1))
            .collect();

        let all_features: Vec<&Array2<f32>> = existing
            .iter()
            .map(|s| &s.feature)
            .chain(fresh.iter())
            .collect();
        let all_labels: Vec<IdentityId> = existing
            .iter()
            .map(|s| s.label)
            .chain(labels.iter().copied())
            .collect();

        let (mean, basis) = self.fit(&all_features, &all_labels)?;
        let projections = all_features
            .iter()
            .map(|f| project(&mean, &basis, f))
            .collect();

        if !preserve_existing {
            self.samples.clear();
        }
        self.samples.extend(
            fresh
                .into_iter()
                .zip(labels)
                .map(|(feature, &label)| Sample::new(feature, label, context)),
        );
        self.mean = mean;
        self.basis = basis;
        self.projections = projections;

        tracing::debug!(
            method = ?self.method,
            samples = self.samples.len(),
            components = self.basis.ncols(),
            "subspace model refit"
        );
        Ok(())
    }

    /// Nearest stored projection to `image`, by Euclidean distance.
    pub fn predict(&self, image: &Array2<f32>) -> Result<Prediction, ModelError> {
        let (rows, cols) = self.sample_shape().ok_or(ModelError::ModelNotTrained)?;
        if self.projections.is_empty() {
            return Err(ModelError::ModelNotTrained);
        }

        let probe = resize_nearest(image, rows, cols);
        let query = project(&self.mean, &self.basis, &probe);

        let mut best: Option<Prediction> = None;
        for (sample, projection) in self.samples.iter().zip(&self.projections) {
            let distance = euclidean(&query, projection);
            if best.map_or(true, |b| distance < b.score) {
                best = Some(Prediction {
                    label: sample.label,
                    score: distance,
                });
            }
        }
        best.ok_or(ModelError::ModelNotTrained)
    }

    fn fit(
        &self,
        features: &[&Array2<f32>],
        labels: &[IdentityId],
    ) -> Result<(Array1<f64>, Array2<f64>), ModelError> {
        let n = features.len();
        let classes = distinct(labels);
        if self.method == SubspaceMethod::Fisher && classes < 2 {
            return Err(ModelError::InsufficientClassDiversity { classes });
        }

        let data = data_matrix(features)?;
        let mean = row_mean(&data);

        let basis = match self.method {
            SubspaceMethod::Eigen => {
                let k = self.max_components.unwrap_or(n).min(n).max(1);
                pca(&data, &mean, k)
            }
            SubspaceMethod::Fisher => {
                let pca_dims = (n - classes).max(classes - 1);
                let pca_basis = pca(&data, &mean, pca_dims);
                let reduced = (&data - &mean).dot(&pca_basis);
                let lda_basis = lda(&reduced, labels, classes - 1);
                pca_basis.dot(&lda_basis)
            }
        };

        if basis.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Numeric("non-finite projection basis".into()));
        }
        Ok((mean, basis))
    }

    /// Samples not yet in the database.
    ///
    /// Mean and basis are derived data and are never stored; the model is
    /// refit from its samples on restore.
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
            state: Vec::new(),
        }
    }

    pub fn mark_persisted(&mut self, row_ids: &[i64]) {
        mark_persisted(&mut self.samples, row_ids);
    }

    /// Rebuild a model from its persisted form.
    ///
    /// The basis is refit over the stored samples.
    pub fn restore(
        method: SubspaceMethod,
        max_components: Option<usize>,
        snapshot: ModelSnapshot,
    ) -> Result<Self, ModelError> {
        let mut model = Self::new(method, max_components);

        for stored in &snapshot.samples {
            let feature = decode(&stored.feature)?.into_f32()?;
            model.samples.push(Sample {
                feature,
                label: stored.label,
                status: SampleStatus::from_row_id(stored.row_id),
                context: stored.context.clone(),
            });
        }
        if model.samples.is_empty() {
            return Ok(model);
        }

        let shape = model.samples[0].feature.dim();
        for sample in &mut model.samples {
            if sample.feature.dim() != shape {
                sample.feature = resize_nearest(&sample.feature, shape.0, shape.1);
            }
        }
        let features: Vec<&Array2<f32>> = model.samples.iter().map(|s| &s.feature).collect();
        let labels = model.labels();
        match model.fit(&features, &labels) {
            Ok((mean, basis)) => {
                model.projections = features.iter().map(|f| project(&mean, &basis, f)).collect();
                model.mean = mean;
                model.basis = basis;
            }
            Err(e) => {
                tracing::warn!(method = ?method, error = %e, "stored samples cannot be fit; model stays untrained");
            }
        }

        Ok(model)
    }
}

fn distinct(labels: &[IdentityId]) -> usize {
    let mut seen: Vec<IdentityId> = labels.to_vec();
    seen.sort();
    seen.dedup();
    seen.len()
}

fn data_matrix(features: &[&Array2<f32>]) -> Result<Array2<f64>, ModelError> {
    let n = features.len();
    let d = features.first().map_or(0, |f| f.len());
    let mut values = Vec::with_capacity(n * d);
    for f in features {
        values.extend(f.iter().map(|&v| v as f64));
    }
    Array2::from_shape_vec((n, d), values).map_err(|e| ModelError::Numeric(e.to_string()))
}

/// Project a raw sample onto the basis, relative to the mean.
fn project(mean: &Array1<f64>, basis: &Array2<f64>, sample: &Array2<f32>) -> Array1<f64> {
    let x: Array1<f64> = sample.iter().map(|&v| v as f64).collect();
    (x - mean).dot(basis)
}

fn add_outer(target: &mut Array2<f64>, v: &Array1<f64>, weight: f64) {
    let k = v.len();
    for i in 0..k {
        for j in 0..k {
            target[[i, j]] += weight * v[i] * v[j];
        }
    }
}

/// Linear discriminant basis of `data` (rows = samples), unit-norm columns.
///
/// Maximises between-class over within-class scatter. The within-class
/// scatter is ridge-regularised so identical samples per class stay solvable.
fn lda(data: &Array2<f64>, labels: &[IdentityId], components: usize) -> Array2<f64> {
    let k = data.ncols();
    let components = components.min(k);
    if k == 0 || components == 0 {
        return Array2::zeros((k, 0));
    }

    let overall = row_mean(data);
    let mut sums: BTreeMap<IdentityId, (Array1<f64>, usize)> = BTreeMap::new();
    for (row, label) in data.rows().into_iter().zip(labels) {
        let entry = sums
            .entry(*label)
            .or_insert_with(|| (Array1::zeros(k), 0));
        entry.0 += &row;
        entry.1 += 1;
    }
    let means: BTreeMap<IdentityId, (Array1<f64>, usize)> = sums
        .into_iter()
        .map(|(label, (sum, count))| (label, (sum / count as f64, count)))
        .collect();

    let mut between = Array2::<f64>::zeros((k, k));
    for (mean, count) in means.values() {
        add_outer(&mut between, &(mean - &overall), *count as f64);
    }

    let mut within = Array2::<f64>::zeros((k, k));
    for (row, label) in data.rows().into_iter().zip(labels) {
        let class_mean = &means[label].0;
        add_outer(&mut within, &(&row - class_mean), 1.0);
    }

    let scale = within.diag().sum() / k as f64;
    let ridge = if scale > 0.0 { scale * 1e-6 } else { 1e-6 };
    let whitening = inverse_sqrt(&within, ridge);

    let m = whitening.dot(&between).dot(&whitening);
    let m = (&m + &m.t()) * 0.5;
    let (_, vectors) = symmetric_eigen(&m);

    let mut basis = Array2::<f64>::zeros((k, components));
    for j in 0..components {
        let w = whitening.dot(&vectors.column(j));
        let norm = w.dot(&w).sqrt();
        if norm > 0.0 {
            basis.column_mut(j).assign(&(w / norm));
        }
    }
    basis
}

//! Nearest-neighbour classifier over externally extracted face embeddings.

use super::{check_labels, mark_persisted, ModelError};
use crate::codec::{decode, encode_f32};
use crate::store::{ModelSnapshot, StoredSample};
use crate::types::{Embedding, IdentityId, Prediction, Sample, SampleStatus};
use ndarray::Array2;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingModel {
    samples: Vec<Sample<Embedding>>,
}

impl EmbeddingModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample<Embedding>] {
        &self.samples
    }

    pub fn labels(&self) -> Vec<IdentityId> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Vector length shared by every stored embedding.
    pub fn dimension(&self) -> Option<usize> {
        self.samples.first().map(|s| s.feature.len())
    }

    pub fn train(
        &mut self,
        vectors: Vec<Embedding>,
        labels: &[IdentityId],
        context: &str,
        preserve_existing: bool,
    ) -> Result<(), ModelError> {
        check_labels(vectors.len(), labels)?;
        if vectors.is_empty() && (!preserve_existing || self.samples.is_empty()) {
            return Err(ModelError::EmptyTrainingSet);
        }

        let existing = if preserve_existing { self.dimension() } else { None };
        let expected = existing
            .or_else(|| vectors.first().map(Embedding::len))
            .unwrap_or(0);
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected || v.is_empty()) {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        if !preserve_existing {
            self.samples.clear();
        }
        self.samples.extend(
            vectors
                .into_iter()
                .zip(labels)
                .map(|(v, &label)| Sample::new(v, label, context)),
        );
        tracing::debug!(samples = self.samples.len(), "embedding gallery updated");
        Ok(())
    }

    /// Stored embedding with the highest cosine similarity to `vector`.
    pub fn predict(&self, vector: &Embedding) -> Result<Prediction, ModelError> {
        let expected = self.dimension().ok_or(ModelError::ModelNotTrained)?;
        if vector.len() != expected {
            return Err(ModelError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        let mut best: Option<Prediction> = None;
        for sample in &self.samples {
            let similarity = f64::from(sample.feature.similarity(vector));
            if best.map_or(true, |b| similarity > b.score) {
                best = Some(Prediction {
                    label: sample.label,
                    score: similarity,
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
            .map(|s| {
                let row = Array2::from_shape_vec((1, s.feature.len()), s.feature.values.clone())
                    .unwrap_or_else(|_| Array2::zeros((1, 0)));
                StoredSample {
                    row_id: None,
                    label: s.label,
                    context: s.context.clone(),
                    feature: encode_f32(&row),
                }
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

    /// Rebuild from stored vectors. Vectors whose length differs from the
    /// first one are skipped.
    pub fn restore(snapshot: ModelSnapshot) -> Result<Self, ModelError> {
        let mut model = Self::new();
        for stored in &snapshot.samples {
            let values: Vec<f32> = decode(&stored.feature)?.into_f32()?.iter().copied().collect();
            if model.dimension().is_some_and(|d| d != values.len()) || values.is_empty() {
                tracing::warn!(row_id = ?stored.row_id, len = values.len(), "skipping embedding with unexpected length");
                continue;
            }
            model.samples.push(Sample {
                feature: Embedding::new(values),
                label: stored.label,
                status: SampleStatus::from_row_id(stored.row_id),
                context: stored.context.clone(),
            });
        }
        Ok(model)
    }
}

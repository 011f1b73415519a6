//! Trainable appearance models. Each keeps its samples in memory and knows how
//! to turn itself into, and back from, a [`ModelSnapshot`](crate::store::ModelSnapshot).

pub mod embedding;
pub mod lbph;
pub mod subspace;

pub use embedding::EmbeddingModel;
pub use lbph::{LbphModel, LbphParams};
pub use subspace::{SubspaceMethod, SubspaceModel};

use crate::codec::CodecError;
use crate::types::{IdentityId, Sample, SampleStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no training samples")]
    EmptyTrainingSet,
    #[error("{samples} samples but {labels} labels")]
    LabelCountMismatch { samples: usize, labels: usize },
    #[error("need at least 2 distinct identities, got {classes}")]
    InsufficientClassDiversity { classes: usize },
    #[error("model has not been trained")]
    ModelNotTrained,
    #[error("feature length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("numeric failure: {0}")]
    Numeric(String),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

pub(crate) fn check_labels(samples: usize, labels: &[IdentityId]) -> Result<(), ModelError> {
    if samples != labels.len() {
        return Err(ModelError::LabelCountMismatch {
            samples,
            labels: labels.len(),
        });
    }
    Ok(())
}

/// Assign database row IDs to in-memory samples, in order.
pub(crate) fn mark_persisted<F>(samples: &mut [Sample<F>], row_ids: &[i64]) {
    let pending = samples
        .iter_mut()
        .filter(|s| s.status == SampleStatus::Created);
    for (sample, &row_id) in pending.zip(row_ids) {
        sample.status = SampleStatus::InDatabase(row_id);
    }
}

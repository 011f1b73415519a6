//! Tunables for the recognition database.

use crate::model::LbphParams;
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LBPH_STRICTNESS: f64 = 0.5;
pub const DEFAULT_EIGEN_THRESHOLD: f64 = 20000.0;
pub const DEFAULT_FISHER_THRESHOLD: f64 = 25000.0;
/// Cosine similarity an embedding match must reach.
pub const DEFAULT_DNN_THRESHOLD: f64 = 0.40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Backend used for recognition and training until changed at runtime.
    pub backend: BackendKind,
    /// LBPH strictness in [0, 1], mapped onto a chi-square threshold.
    pub lbph_strictness: f64,
    pub eigen_threshold: f64,
    pub fisher_threshold: f64,
    pub dnn_threshold: f64,
    pub lbph: LbphParams,
    /// Cap on retained Eigenfaces components; unset keeps one per sample.
    pub eigen_components: Option<usize>,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Lbph,
            lbph_strictness: DEFAULT_LBPH_STRICTNESS,
            eigen_threshold: DEFAULT_EIGEN_THRESHOLD,
            fisher_threshold: DEFAULT_FISHER_THRESHOLD,
            dnn_threshold: DEFAULT_DNN_THRESHOLD,
            lbph: LbphParams::default(),
            eigen_components: None,
        }
    }
}

impl RecognitionSettings {
    /// The value `set_threshold` receives for `kind` (strictness for LBPH).
    pub fn threshold_setting(&self, kind: BackendKind) -> f64 {
        match kind {
            BackendKind::Lbph => self.lbph_strictness,
            BackendKind::EigenFace => self.eigen_threshold,
            BackendKind::FisherFace => self.fisher_threshold,
            BackendKind::Dnn => self.dnn_threshold,
        }
    }

    pub fn set_threshold_setting(&mut self, kind: BackendKind, value: f64) {
        match kind {
            BackendKind::Lbph => self.lbph_strictness = value,
            BackendKind::EigenFace => self.eigen_threshold = value,
            BackendKind::FisherFace => self.fisher_threshold = value,
            BackendKind::Dnn => self.dnn_threshold = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = RecognitionSettings::default();
        assert_eq!(s.backend, BackendKind::Lbph);
        assert_eq!(s.threshold_setting(BackendKind::EigenFace), 20000.0);
        assert_eq!(s.threshold_setting(BackendKind::FisherFace), 25000.0);
        assert_eq!(s.threshold_setting(BackendKind::Dnn), 0.40);
        assert_eq!(s.lbph, LbphParams::default());
    }

    #[test]
    fn test_set_threshold_setting() {
        let mut s = RecognitionSettings::default();
        s.set_threshold_setting(BackendKind::Lbph, 0.9);
        assert_eq!(s.lbph_strictness, 0.9);
        assert_eq!(s.threshold_setting(BackendKind::Lbph), 0.9);
    }
}

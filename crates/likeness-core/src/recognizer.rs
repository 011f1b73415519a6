//! Per-backend recognizers: image preparation plus the threshold decision
//! around one model.
//!
//! Numeric faults never escape a recognizer. `recognize` turns them into
//! "unknown" and `train` into a skipped batch, both logged.

use crate::extractor::{EmbeddingExtractor, ExtractorError};
use crate::model::lbph::threshold_for_strictness;
use crate::model::{EmbeddingModel, LbphModel, LbphParams, ModelError, SubspaceMethod, SubspaceModel};
use crate::preprocess::{gray_to_matrix, prepare_grayscale, prepare_rgb};
use crate::settings::RecognitionSettings;
use crate::store::ModelSnapshot;
use crate::types::{BackendKind, Embedding, IdentityId, Prediction};
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("embedding extraction: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("no embedding extractor configured")]
    NoExtractor,
    #[error("{backend} expects a {expected} face")]
    WrongRepresentation {
        backend: BackendKind,
        expected: &'static str,
    },
}

/// A face normalized for one backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedFace {
    /// Equalized grayscale, for LBPH and the subspace backends.
    Gray(GrayImage),
    /// Unequalized RGB, for the embedding backend.
    Rgb(RgbImage),
}

impl PreparedFace {
    fn gray_matrix(&self, backend: BackendKind) -> Result<Array2<f32>, RecognizeError> {
        match self {
            PreparedFace::Gray(gray) => Ok(gray_to_matrix(gray)),
            PreparedFace::Rgb(_) => Err(RecognizeError::WrongRepresentation {
                backend,
                expected: "grayscale",
            }),
        }
    }

    fn rgb(&self, backend: BackendKind) -> Result<&RgbImage, RecognizeError> {
        match self {
            PreparedFace::Rgb(rgb) => Ok(rgb),
            PreparedFace::Gray(_) => Err(RecognizeError::WrongRepresentation {
                backend,
                expected: "RGB",
            }),
        }
    }
}

pub trait Recognizer: Send {
    fn kind(&self) -> BackendKind;

    /// Effective decision threshold, in score units.
    fn threshold(&self) -> f64;

    /// Apply a threshold setting. LBPH reads the value as a strictness in
    /// [0, 1]; every other backend takes it verbatim.
    fn set_threshold(&mut self, value: f64);

    fn prepare(&self, image: &DynamicImage) -> PreparedFace;

    /// Nearest training sample and its raw score.
    fn predict(&mut self, face: &PreparedFace) -> Result<Prediction, RecognizeError>;

    /// Append a labeled batch to the model.
    fn fit(&mut self, faces: &[PreparedFace], labels: &[IdentityId], context: &str) -> Result<(), RecognizeError>;

    fn sample_count(&self) -> usize;

    /// Samples not yet persisted plus the model's derived state.
    fn pending_snapshot(&self) -> ModelSnapshot;

    fn mark_persisted(&mut self, row_ids: &[i64]);

    /// Give back the embedding extractor, if this recognizer owns one.
    fn take_extractor(&mut self) -> Option<Box<dyn EmbeddingExtractor>> {
        None
    }

    fn accepts(&self, score: f64) -> bool {
        if self.kind().is_similarity() {
            score >= self.threshold()
        } else {
            score <= self.threshold()
        }
    }

    /// Identity of the best match, or `None` when nothing passes the threshold.
    fn recognize(&mut self, face: &PreparedFace) -> Option<IdentityId> {
        match self.predict(face) {
            Ok(p) if self.accepts(p.score) => Some(p.label),
            Ok(p) => {
                tracing::debug!(backend = %self.kind(), score = p.score, threshold = self.threshold(), "no match within threshold");
                None
            }
            Err(RecognizeError::Model(ModelError::ModelNotTrained)) => {
                tracing::debug!(backend = %self.kind(), "recognizer has no training data");
                None
            }
            Err(e) => {
                tracing::warn!(backend = %self.kind(), error = %e, "recognition failed");
                None
            }
        }
    }

    /// Train on a batch. Returns whether the model changed.
    fn train(&mut self, faces: &[PreparedFace], labels: &[IdentityId], context: &str) -> bool {
        if faces.is_empty() || faces.len() != labels.len() {
            tracing::warn!(
                backend = %self.kind(),
                faces = faces.len(),
                labels = labels.len(),
                "skipping training: no faces or label count mismatch"
            );
            return false;
        }
        match self.fit(faces, labels, context) {
            Ok(()) => {
                tracing::info!(backend = %self.kind(), faces = faces.len(), total = self.sample_count(), context, "trained");
                true
            }
            Err(e) => {
                tracing::warn!(backend = %self.kind(), error = %e, "training skipped");
                false
            }
        }
    }
}

pub struct LbphRecognizer {
    model: LbphModel,
    strictness: f64,
    threshold: f64,
}

impl LbphRecognizer {
    pub fn new(params: LbphParams, strictness: f64) -> Result<Self, ModelError> {
        Ok(Self::with_model(LbphModel::new(params)?, strictness))
    }

    fn with_model(model: LbphModel, strictness: f64) -> Self {
        Self {
            model,
            strictness,
            threshold: threshold_for_strictness(strictness),
        }
    }

    pub fn strictness(&self) -> f64 {
        self.strictness
    }

    pub fn model(&self) -> &LbphModel {
        &self.model
    }
}

impl Recognizer for LbphRecognizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Lbph
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn set_threshold(&mut self, value: f64) {
        self.strictness = value;
        self.threshold = threshold_for_strictness(value);
    }

    fn prepare(&self, image: &DynamicImage) -> PreparedFace {
        PreparedFace::Gray(prepare_grayscale(image))
    }

    fn predict(&mut self, face: &PreparedFace) -> Result<Prediction, RecognizeError> {
        let image = face.gray_matrix(self.kind())?;
        Ok(self.model.predict(&image)?)
    }

    fn fit(&mut self, faces: &[PreparedFace], labels: &[IdentityId], context: &str) -> Result<(), RecognizeError> {
        let images = faces
            .iter()
            .map(|f| f.gray_matrix(self.kind()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.model.train(&images, labels, context, true)?)
    }

    fn sample_count(&self) -> usize {
        self.model.len()
    }

    fn pending_snapshot(&self) -> ModelSnapshot {
        self.model.pending_snapshot()
    }

    fn mark_persisted(&mut self, row_ids: &[i64]) {
        self.model.mark_persisted(row_ids);
    }
}

/// Eigenfaces or Fisherfaces, depending on the wrapped model's method.
pub struct SubspaceRecognizer {
    model: SubspaceModel,
    threshold: f64,
}

impl SubspaceRecognizer {
    pub fn eigenfaces(max_components: Option<usize>, threshold: f64) -> Self {
        Self {
            model: SubspaceModel::eigenfaces(max_components),
            threshold,
        }
    }

    pub fn fisherfaces(threshold: f64) -> Self {
        Self {
            model: SubspaceModel::fisherfaces(),
            threshold,
        }
    }

    pub fn model(&self) -> &SubspaceModel {
        &self.model
    }
}

impl Recognizer for SubspaceRecognizer {
    fn kind(&self) -> BackendKind {
        match self.model.method() {
            SubspaceMethod::Eigen => BackendKind::EigenFace,
            SubspaceMethod::Fisher => BackendKind::FisherFace,
        }
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn set_threshold(&mut self, value: f64) {
        self.threshold = value;
    }

    fn prepare(&self, image: &DynamicImage) -> PreparedFace {
        PreparedFace::Gray(prepare_grayscale(image))
    }

    fn predict(&mut self, face: &PreparedFace) -> Result<Prediction, RecognizeError> {
        let image = face.gray_matrix(self.kind())?;
        Ok(self.model.predict(&image)?)
    }

    fn fit(&mut self, faces: &[PreparedFace], labels: &[IdentityId], context: &str) -> Result<(), RecognizeError> {
        let images = faces
            .iter()
            .map(|f| f.gray_matrix(self.kind()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.model.train(images, labels, context, true)?)
    }

    fn sample_count(&self) -> usize {
        self.model.len()
    }

    fn pending_snapshot(&self) -> ModelSnapshot {
        self.model.pending_snapshot()
    }

    fn mark_persisted(&mut self, row_ids: &[i64]) {
        self.model.mark_persisted(row_ids);
    }
}

pub struct DnnRecognizer {
    model: EmbeddingModel,
    extractor: Option<Box<dyn EmbeddingExtractor>>,
    threshold: f64,
}

impl DnnRecognizer {
    pub fn new(extractor: Option<Box<dyn EmbeddingExtractor>>, threshold: f64) -> Self {
        Self {
            model: EmbeddingModel::new(),
            extractor,
            threshold,
        }
    }

    pub fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    fn embed(&mut self, face: &PreparedFace) -> Result<Embedding, RecognizeError> {
        let rgb = face.rgb(BackendKind::Dnn)?;
        let extractor = self.extractor.as_mut().ok_or(RecognizeError::NoExtractor)?;
        Ok(extractor.extract(rgb)?)
    }
}

impl Recognizer for DnnRecognizer {
    fn kind(&self) -> BackendKind {
        BackendKind::Dnn
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn set_threshold(&mut self, value: f64) {
        self.threshold = value;
    }

    fn prepare(&self, image: &DynamicImage) -> PreparedFace {
        PreparedFace::Rgb(prepare_rgb(image))
    }

    fn predict(&mut self, face: &PreparedFace) -> Result<Prediction, RecognizeError> {
        if self.model.is_empty() {
            return Err(ModelError::ModelNotTrained.into());
        }
        let embedding = self.embed(face)?;
        Ok(self.model.predict(&embedding)?)
    }

    fn fit(&mut self, faces: &[PreparedFace], labels: &[IdentityId], context: &str) -> Result<(), RecognizeError> {
        let vectors = faces
            .iter()
            .map(|f| self.embed(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.model.train(vectors, labels, context, true)?)
    }

    fn sample_count(&self) -> usize {
        self.model.len()
    }

    fn pending_snapshot(&self) -> ModelSnapshot {
        self.model.pending_snapshot()
    }

    fn mark_persisted(&mut self, row_ids: &[i64]) {
        self.model.mark_persisted(row_ids);
    }

    fn take_extractor(&mut self) -> Option<Box<dyn EmbeddingExtractor>> {
        self.extractor.take()
    }
}

/// Build the recognizer for `kind`, restoring its model from `snapshot` when
/// one was persisted. The DNN recognizer takes `extractor` only once its
/// model has been restored successfully.
pub fn create_recognizer(
    kind: BackendKind,
    settings: &RecognitionSettings,
    snapshot: Option<ModelSnapshot>,
    extractor: &mut Option<Box<dyn EmbeddingExtractor>>,
) -> Result<Box<dyn Recognizer>, ModelError> {
    let threshold = settings.threshold_setting(kind);
    let recognizer: Box<dyn Recognizer> = match kind {
        BackendKind::Lbph => {
            let model = match snapshot {
                Some(snapshot) => LbphModel::restore(settings.lbph, snapshot)?,
                None => LbphModel::new(settings.lbph)?,
            };
            Box::new(LbphRecognizer::with_model(model, threshold))
        }
        BackendKind::EigenFace | BackendKind::FisherFace => {
            let (method, components) = if kind == BackendKind::EigenFace {
                (SubspaceMethod::Eigen, settings.eigen_components)
            } else {
                (SubspaceMethod::Fisher, None)
            };
            let model = match snapshot {
                Some(snapshot) => SubspaceModel::restore(method, components, snapshot)?,
                None if method == SubspaceMethod::Eigen => SubspaceModel::eigenfaces(components),
                None => SubspaceModel::fisherfaces(),
            };
            Box::new(SubspaceRecognizer { model, threshold })
        }
        BackendKind::Dnn => {
            let model = match snapshot {
                Some(snapshot) => EmbeddingModel::restore(snapshot)?,
                None => EmbeddingModel::new(),
            };
            Box::new(DnnRecognizer {
                model,
                extractor: extractor.take(),
                threshold,
            })
        }
    };
    tracing::debug!(backend = %kind, samples = recognizer.sample_count(), "recognizer loaded");
    Ok(recognizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn face(seed: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(48, 48, |x, y| {
            Luma([((x * (3 + seed)) ^ (y * (7 + seed))) as u8])
        }))
    }

    fn mean_rgb_extractor() -> Box<dyn EmbeddingExtractor> {
        Box::new(|face: &RgbImage| -> Result<Embedding, ExtractorError> {
            let mut sums = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sums[c] += p.0[c] as f32;
                }
            }
            Ok(Embedding::new(sums.to_vec()))
        })
    }

    #[test]
    fn test_prepare_representations() {
        let lbph = LbphRecognizer::new(LbphParams::default(), 0.5).unwrap();
        assert!(matches!(lbph.prepare(&face(1)), PreparedFace::Gray(_)));
        let dnn = DnnRecognizer::new(None, 0.4);
        let big = DynamicImage::ImageRgb8(RgbImage::new(512, 300));
        match dnn.prepare(&big) {
            PreparedFace::Rgb(rgb) => assert_eq!(rgb.dimensions(), (256, 256)),
            PreparedFace::Gray(_) => panic!("expected RGB"),
        }
    }

    #[test]
    fn test_lbph_recognize_and_unknown() {
        let mut r = LbphRecognizer::new(LbphParams::default(), 0.5).unwrap();
        assert_eq!(r.threshold(), 90.0);
        let faces: Vec<PreparedFace> = (1..=2).map(|s| r.prepare(&face(s))).collect();
        assert!(r.train(&faces, &[IdentityId(1), IdentityId(2)], "test"));
        assert_eq!(r.recognize(&faces[1]), Some(IdentityId(2)));

        r.set_threshold(1.0);
        let other = r.prepare(&face(9));
        let p = r.predict(&other).unwrap();
        if p.score > r.threshold() {
            assert_eq!(r.recognize(&other), None);
        }
    }

    #[test]
    fn test_untrained_recognizer_reports_unknown() {
        let mut r = SubspaceRecognizer::eigenfaces(None, 20000.0);
        let f = r.prepare(&face(1));
        assert_eq!(r.recognize(&f), None);
    }

    #[test]
    fn test_train_skips_empty_and_mismatched_batches() {
        let mut r = LbphRecognizer::new(LbphParams::default(), 0.5).unwrap();
        assert!(!r.train(&[], &[], "x"));
        let f = r.prepare(&face(1));
        assert!(!r.train(&[f], &[], "x"));
        assert_eq!(r.sample_count(), 0);
    }

    #[test]
    fn test_fisher_single_class_is_skipped() {
        let mut r = SubspaceRecognizer::fisherfaces(25000.0);
        let faces: Vec<PreparedFace> = (1..=3).map(|s| r.prepare(&face(s))).collect();
        assert!(!r.train(&faces, &[IdentityId(1); 3], ""));
        assert_eq!(r.sample_count(), 0);
        assert!(r.train(&faces, &[IdentityId(1), IdentityId(1), IdentityId(2)], ""));
        assert_eq!(r.kind(), BackendKind::FisherFace);
    }

    #[test]
    fn test_wrong_representation_is_unknown() {
        let mut r = LbphRecognizer::new(LbphParams::default(), 0.5).unwrap();
        let f = r.prepare(&face(1));
        r.train(&[f], &[IdentityId(1)], "");
        let rgb = PreparedFace::Rgb(RgbImage::new(8, 8));
        assert!(matches!(r.predict(&rgb), Err(RecognizeError::WrongRepresentation { .. })));
        assert_eq!(r.recognize(&rgb), None);
    }

    #[test]
    fn test_distance_backends_accept_more_as_threshold_grows() {
        let mut r = SubspaceRecognizer::eigenfaces(None, 0.0);
        let train: Vec<PreparedFace> = (1..=4).map(|s| r.prepare(&face(s))).collect();
        r.train(&train, &[IdentityId(1), IdentityId(2), IdentityId(3), IdentityId(4)], "");
        let probes: Vec<PreparedFace> = (1..=10).map(|s| r.prepare(&face(s))).collect();

        let mut last = 0;
        for threshold in [0.0, 10.0, 1000.0, 5000.0, 20000.0, 1e6, 1e9] {
            r.set_threshold(threshold);
            let accepted = probes.iter().filter(|p| r.recognize(p).is_some()).count();
            assert!(accepted >= last);
            last = accepted;
        }
        assert_eq!(last, probes.len());
    }

    #[test]
    fn test_dnn_accepts_fewer_as_threshold_grows() {
        let mut r = DnnRecognizer::new(Some(mean_rgb_extractor()), 0.0);
        let red = PreparedFace::Rgb(RgbImage::from_pixel(4, 4, Rgb([200, 10, 10])));
        let green = PreparedFace::Rgb(RgbImage::from_pixel(4, 4, Rgb([10, 200, 10])));
        assert!(r.train(&[red.clone(), green.clone()], &[IdentityId(1), IdentityId(2)], ""));
        assert_eq!(r.recognize(&red), Some(IdentityId(1)));

        let probes: Vec<PreparedFace> = (0..8u8)
            .map(|i| PreparedFace::Rgb(RgbImage::from_pixel(4, 4, Rgb([i * 30, 100, 255 - i * 30]))))
            .collect();
        let mut last = usize::MAX;
        for threshold in [-1.0, 0.0, 0.3, 0.6, 0.9, 0.99, 1.01] {
            r.set_threshold(threshold);
            let accepted = probes.iter().filter(|p| r.recognize(p).is_some()).count();
            assert!(accepted <= last);
            last = accepted;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn test_dnn_without_extractor_skips() {
        let mut r = DnnRecognizer::new(None, 0.4);
        let f = PreparedFace::Rgb(RgbImage::new(4, 4));
        assert!(!r.train(&[f.clone()], &[IdentityId(1)], ""));
        assert!(matches!(r.fit(&[f], &[IdentityId(1)], ""), Err(RecognizeError::NoExtractor)));
    }

    #[test]
    fn test_create_recognizer_restores_snapshot() {
        let settings = RecognitionSettings::default();
        let mut r = create_recognizer(BackendKind::Lbph, &settings, None, &mut None).unwrap();
        let f = r.prepare(&face(3));
        r.train(&[f.clone()], &[IdentityId(5)], "ctx");
        let mut snapshot = r.pending_snapshot();
        snapshot.samples[0].row_id = Some(1);

        let mut restored =
            create_recognizer(BackendKind::Lbph, &settings, Some(snapshot), &mut None).unwrap();
        assert_eq!(restored.sample_count(), 1);
        assert_eq!(restored.recognize(&f), Some(IdentityId(5)));
        assert_eq!(restored.threshold(), 90.0);

        for kind in BackendKind::ALL {
            let r = create_recognizer(kind, &settings, None, &mut None).unwrap();
            assert_eq!(r.kind(), kind);
        }
    }

    #[test]
    fn test_extractor_moves_into_dnn_and_back() {
        let settings = RecognitionSettings::default();
        let mut extractor = Some(mean_rgb_extractor());
        let mut lbph = create_recognizer(BackendKind::Lbph, &settings, None, &mut extractor).unwrap();
        assert!(extractor.is_some());
        assert!(lbph.take_extractor().is_none());

        let mut dnn = create_recognizer(BackendKind::Dnn, &settings, None, &mut extractor).unwrap();
        assert!(extractor.is_none());
        assert!(dnn.take_extractor().is_some());
    }
}

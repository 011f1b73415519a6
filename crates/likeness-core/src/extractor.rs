//! Face embedding extraction.
//!
//! The DNN backend never computes embeddings itself; it asks an
//! [`EmbeddingExtractor`]. With the `arcface` feature enabled, [`ArcFaceExtractor`]
//! runs the insightface w600k_r50 ArcFace model through ONNX Runtime.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

pub const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, not 128
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[cfg(feature = "arcface")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a prepared RGB face crop into an embedding vector.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError>;
}

impl<F> EmbeddingExtractor for F
where
    F: FnMut(&RgbImage) -> Result<Embedding, ExtractorError> + Send,
{
    fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError> {
        self(face)
    }
}

/// Resize a face crop to 112×112 and lay it out as a normalized NCHW tensor.
pub fn arcface_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let resized;
    let face = if face.dimensions() == (size as u32, size as u32) {
        face
    } else {
        resized = imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

/// L2-normalize in place. Zero vectors are left as they are.
pub fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(feature = "arcface")]
pub use arcface::ArcFaceExtractor;

#[cfg(feature = "arcface")]
mod arcface {
    use super::*;
    use ort::session::Session;
    use ort::value::TensorRef;
    use std::path::Path;

    /// ArcFace embedding extractor.
    pub struct ArcFaceExtractor {
        session: Session,
    }

    impl ArcFaceExtractor {
        /// Load the ArcFace ONNX model from the given path.
        pub fn load(model_path: &str) -> Result<Self, ExtractorError> {
            if !Path::new(model_path).exists() {
                return Err(ExtractorError::ModelNotFound(model_path.to_string()));
            }

            let session = Session::builder()?
                .with_intra_threads(2)?
                .commit_from_file(model_path)?;

            tracing::info!(
                path = model_path,
                inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
                "loaded ArcFace model"
            );

            Ok(Self { session })
        }
    }

    impl EmbeddingExtractor for ArcFaceExtractor {
        fn extract(&mut self, face: &RgbImage) -> Result<Embedding, ExtractorError> {
            let input = arcface_tensor(face);
            let outputs = self
                .session
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let (_, raw) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

            let mut values = raw.to_vec();
            if values.len() != ARCFACE_EMBEDDING_DIM {
                return Err(ExtractorError::InferenceFailed(format!(
                    "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                    values.len()
                )));
            }
            l2_normalize(&mut values);
            Ok(Embedding::new(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_shape_and_resize() {
        let face = RgbImage::from_pixel(40, 60, Rgb([10, 20, 30]));
        let tensor = arcface_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_tensor_normalization_per_channel() {
        let face = RgbImage::from_pixel(112, 112, Rgb([0, 255, 128]));
        let tensor = arcface_tensor(&face);
        assert!((tensor[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0; 3];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 3]);
    }

    #[test]
    fn test_closure_extractor() {
        let mut extractor = |face: &RgbImage| -> Result<Embedding, ExtractorError> {
            Ok(Embedding::new(vec![face.width() as f32, face.height() as f32]))
        };
        let e = extractor.extract(&RgbImage::new(3, 4)).unwrap();
        assert_eq!(e.values, vec![3.0, 4.0]);
    }
}

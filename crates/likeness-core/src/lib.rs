//! likeness-core: incremental face recognition.
//!
//! Four interchangeable backends (LBPH, Eigenfaces, Fisherfaces and a DNN
//! embedding gallery) behind one [`RecognitionDatabase`]. Training samples
//! accumulate across sessions and are persisted through the [`FaceStore`]
//! contract; model arrays cross it as [`MatrixBlob`]s.
//!
//! Face detection and alignment happen upstream: every image handed in is
//! expected to be a single cropped face.

pub mod codec;
pub mod database;
pub mod error;
pub mod extractor;
pub mod linalg;
pub mod model;
pub mod preprocess;
pub mod provider;
pub mod recognizer;
pub mod registry;
pub mod settings;
pub mod store;
pub mod types;

pub use codec::{MatrixBlob, BLOB_FORMAT_VERSION};
pub use database::RecognitionDatabase;
pub use error::FacesError;
pub use extractor::EmbeddingExtractor;
#[cfg(feature = "arcface")]
pub use extractor::ArcFaceExtractor;
pub use provider::{SimpleTrainingDataProvider, TrainingDataProvider};
pub use recognizer::{PreparedFace, Recognizer};
pub use registry::IdentityRegistry;
pub use settings::RecognitionSettings;
pub use store::{FaceStore, MemoryStore, ModelSnapshot, StoreError, StoredSample};
pub use types::{attribute, Attributes, BackendKind, Embedding, Identity, IdentityId, TrainingCostHint};

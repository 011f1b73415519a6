//! Recognition database: the single entry point for identities, training and
//! recognition.
//!
//! One mutex serializes every operation. Recognizers are created lazily per
//! backend on first use and loaded from the store; training writes through to
//! the store after each batch. If the store cannot be reached at construction
//! the database degrades to a no-op mode: reads return nothing and writes
//! report [`FacesError::DatabaseUnavailable`].

use crate::error::FacesError;
use crate::extractor::EmbeddingExtractor;
use crate::preprocess::MAX_FACE_SIZE;
use crate::provider::TrainingDataProvider;
use crate::recognizer::{create_recognizer, PreparedFace, Recognizer};
use crate::registry::IdentityRegistry;
use crate::settings::RecognitionSettings;
use crate::store::{FaceStore, MemoryStore, StoreError};
use crate::types::{attribute, Attributes, BackendKind, Identity, IdentityId, TrainingCostHint};
use image::DynamicImage;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const PARAM_THRESHOLD: &str = "threshold";
pub const PARAM_ACCURACY: &str = "accuracy";

pub struct RecognitionDatabase {
    inner: Option<Mutex<Inner>>,
}

struct Inner {
    store: Box<dyn FaceStore>,
    registry: IdentityRegistry,
    settings: RecognitionSettings,
    parameters: BTreeMap<String, f64>,
    recognizers: HashMap<BackendKind, Box<dyn Recognizer>>,
    /// Parked here while the DNN recognizer is not loaded.
    extractor: Option<Box<dyn EmbeddingExtractor>>,
}

impl RecognitionDatabase {
    /// Wrap a store, loading the identity cache from it.
    pub fn new(store: Box<dyn FaceStore>, settings: RecognitionSettings) -> Self {
        match store.identities() {
            Ok(identities) => {
                tracing::info!(
                    identities = identities.len(),
                    backend = %settings.backend,
                    "face database ready"
                );
                let inner = Inner {
                    store,
                    registry: identities.into_iter().collect(),
                    settings,
                    parameters: BTreeMap::new(),
                    recognizers: HashMap::new(),
                    extractor: None,
                };
                Self {
                    inner: Some(Mutex::new(inner)),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "face database unavailable, recognition disabled");
                Self::unavailable()
            }
        }
    }

    /// Like [`new`](Self::new), but takes the outcome of opening a store.
    pub fn open<S: FaceStore + 'static>(store: Result<S, StoreError>, settings: RecognitionSettings) -> Self {
        match store {
            Ok(store) => Self::new(Box::new(store), settings),
            Err(e) => {
                tracing::error!(error = %e, "face database unavailable, recognition disabled");
                Self::unavailable()
            }
        }
    }

    /// Non-durable database.
    pub fn in_memory(settings: RecognitionSettings) -> Self {
        Self::new(Box::new(MemoryStore::new()), settings)
    }

    /// A database in no-op mode.
    pub fn unavailable() -> Self {
        Self { inner: None }
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        self.inner
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_or_err(&self) -> Result<MutexGuard<'_, Inner>, FacesError> {
        self.lock().ok_or(FacesError::DatabaseUnavailable)
    }

    /// Install the embedding extractor used by the DNN backend.
    pub fn set_extractor(&self, extractor: Box<dyn EmbeddingExtractor>) {
        if let Some(mut inner) = self.lock() {
            inner.unload(BackendKind::Dnn);
            inner.extractor = Some(extractor);
        }
    }

    // --- Identities ---

    pub fn all_identities(&self) -> Vec<Identity> {
        self.lock().map(|inner| inner.registry.all()).unwrap_or_default()
    }

    pub fn identity(&self, id: IdentityId) -> Option<Identity> {
        self.lock()?.registry.get(id).cloned()
    }

    /// First identity having `value` among its values for `key`.
    pub fn find_identity(&self, key: &str, value: &str) -> Option<Identity> {
        self.lock()?.registry.find_by_attribute(key, value).cloned()
    }

    /// Best match for a set of attributes; see [`IdentityRegistry::find_by_attributes`].
    pub fn find_identity_by(&self, attributes: &Attributes) -> Option<Identity> {
        self.lock()?.registry.find_by_attributes(attributes).cloned()
    }

    /// Create an identity.
    ///
    /// If `attributes` carries a `uuid` that already exists, that identity is
    /// returned unchanged. A missing `uuid` is generated. The identity and its
    /// attributes are stored together or not at all.
    ///
    /// Fails with [`FacesError::DatabaseUnavailable`] in no-op mode instead of
    /// returning an empty identity; the other write methods behave the same.
    pub fn add_identity(&self, attributes: &Attributes) -> Result<Identity, FacesError> {
        let mut inner = self.lock_or_err()?;

        let uuid = attributes
            .get(attribute::UUID)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        if let Some(uuid) = &uuid {
            if let Some(existing) = inner.registry.find_by_attribute(attribute::UUID, uuid) {
                tracing::warn!(id = %existing.id, uuid, "identity with this uuid already exists");
                return Ok(existing.clone());
            }
        }

        let mut attrs = Attributes::new();
        attrs.insert(
            attribute::UUID,
            uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        for (key, value) in attributes.iter().filter(|(k, _)| *k != attribute::UUID) {
            attrs.insert(key, value);
        }

        let id = inner.store.add_identity(&attrs)?;
        let identity = Identity::new(id, attrs);
        inner.registry.insert(identity.clone());
        tracing::info!(id = %id, uuid = identity.uuid().unwrap_or_default(), "identity added");
        Ok(identity)
    }

    /// Add one value under `key`, keeping existing values.
    pub fn add_identity_attribute(&self, id: IdentityId, key: &str, value: &str) -> Result<Identity, FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.update_attributes(id, |attrs| {
            if key != attribute::UUID && !attrs.contains(key, value) {
                attrs.insert(key, value);
            }
        })
    }

    /// Merge `attributes` into the identity's attributes.
    pub fn add_identity_attributes(&self, id: IdentityId, attributes: &Attributes) -> Result<Identity, FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.update_attributes(id, |attrs| {
            let additions: Attributes = attributes
                .iter()
                .filter(|(k, _)| *k != attribute::UUID)
                .collect();
            attrs.unite(&additions);
        })
    }

    /// Replace the identity's attributes. Its `uuid` is kept.
    pub fn set_identity_attributes(&self, id: IdentityId, attributes: &Attributes) -> Result<Identity, FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.update_attributes(id, |attrs| {
            let uuids: Vec<String> = attrs.get_all(attribute::UUID).map(str::to_string).collect();
            let mut replaced = Attributes::new();
            for uuid in uuids {
                replaced.insert(attribute::UUID, uuid);
            }
            for (key, value) in attributes.iter().filter(|(k, _)| *k != attribute::UUID) {
                replaced.insert(key, value);
            }
            *attrs = replaced;
        })
    }

    /// Delete an identity and, through the store, all of its training samples.
    pub fn delete_identity(&self, id: IdentityId) -> Result<(), FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.store.delete_identity(id)?;
        inner.registry.remove(id);
        inner.unload_all();
        tracing::info!(id = %id, "identity deleted");
        Ok(())
    }

    // --- Recognition ---

    pub fn recognize_face(&self, image: &DynamicImage) -> Option<Identity> {
        self.recognize_faces(std::slice::from_ref(image))
            .into_iter()
            .next()
            .flatten()
    }

    /// One result per image; `None` where no identity passes the threshold.
    pub fn recognize_faces(&self, images: &[DynamicImage]) -> Vec<Option<Identity>> {
        match self.lock() {
            Some(mut inner) => inner.recognize(images),
            None => vec![None; images.len()],
        }
    }

    // --- Training ---

    /// Train the active backend with images of one identity.
    ///
    /// Returns whether the model took the batch. A skipped batch is logged,
    /// not reported as an error.
    pub fn train(&self, identity: &Identity, images: &[DynamicImage], context: &str) -> Result<bool, FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.train_identity(identity, images, context)
    }

    /// Train several identities, one batch per identity, each persisted on its own.
    ///
    /// Fisherfaces cannot learn from a single identity, so for that backend
    /// the identities' images go in as one combined batch.
    ///
    /// Returns the number of identities whose images were taken.
    pub fn train_with_provider(
        &self,
        identities: &[Identity],
        provider: &mut dyn TrainingDataProvider,
        context: &str,
    ) -> Result<usize, FacesError> {
        let mut inner = self.lock_or_err()?;

        if inner.settings.backend == BackendKind::FisherFace {
            let mut images = Vec::new();
            let mut labels = Vec::new();
            let mut contributors = 0;
            for identity in identities {
                if inner.registry.get(identity.id).is_none() {
                    tracing::warn!(id = %identity.id, "skipping unknown identity");
                    continue;
                }
                let batch = provider.new_images(identity);
                if !batch.is_empty() {
                    contributors += 1;
                }
                labels.extend(std::iter::repeat(identity.id).take(batch.len()));
                images.extend(batch);
            }
            let trained = inner.train_batch(&images, &labels, context)?;
            return Ok(if trained { contributors } else { 0 });
        }

        let mut trained = 0;
        for identity in identities {
            let images = provider.new_images(identity);
            match inner.train_identity(identity, &images, context) {
                Ok(true) => trained += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(id = %identity.id, error = %e, "training identity failed"),
            }
        }
        Ok(trained)
    }

    /// Number of samples held by the active backend.
    pub fn trained_samples(&self) -> Result<usize, FacesError> {
        let mut inner = self.lock_or_err()?;
        let kind = inner.settings.backend;
        Ok(inner.recognizer(kind)?.sample_count())
    }

    /// Delete training samples of every backend, optionally only those of one context.
    pub fn clear_all_training(&self, context: Option<&str>) -> Result<(), FacesError> {
        let mut inner = self.lock_or_err()?;
        for kind in BackendKind::ALL {
            inner.store.clear_training(kind, None, context)?;
        }
        inner.unload_all();
        tracing::info!(context, "cleared all training");
        Ok(())
    }

    /// Delete the active backend's samples for `identities`, optionally only one context.
    pub fn clear_training(&self, identities: &[IdentityId], context: Option<&str>) -> Result<(), FacesError> {
        if identities.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock_or_err()?;
        let kind = inner.settings.backend;
        inner.store.clear_training(kind, Some(identities), context)?;
        inner.unload(kind);
        tracing::info!(backend = %kind, identities = identities.len(), context, "cleared training");
        Ok(())
    }

    // --- Configuration ---

    pub fn set_active_backend(&self, kind: BackendKind) {
        if let Some(mut inner) = self.lock() {
            if inner.settings.backend != kind {
                tracing::info!(from = %inner.settings.backend, to = %kind, "active backend changed");
            }
            inner.settings.backend = kind;
        }
    }

    /// Active backend; the default backend when the database is unavailable.
    pub fn active_backend(&self) -> BackendKind {
        self.lock()
            .map(|inner| inner.settings.backend)
            .unwrap_or_else(|| RecognitionSettings::default().backend)
    }

    pub fn backend_identifier(&self) -> &'static str {
        self.active_backend().identifier()
    }

    /// Set `threshold` (or its alias `accuracy`) on the active backend.
    pub fn set_parameter(&self, key: &str, value: f64) -> Result<(), FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.set_parameter(key, value)
    }

    /// Apply several parameters. Nothing is applied if any key is unknown.
    pub fn set_parameters(&self, parameters: &BTreeMap<String, f64>) -> Result<(), FacesError> {
        let mut inner = self.lock_or_err()?;
        if let Some(unknown) = parameters.keys().find(|k| !is_known_parameter(k)) {
            return Err(FacesError::UnknownParameter(unknown.clone()));
        }
        for (key, value) in parameters {
            inner.set_parameter(key, *value)?;
        }
        Ok(())
    }

    /// Parameters set so far.
    pub fn parameters(&self) -> BTreeMap<String, f64> {
        self.lock()
            .map(|inner| inner.parameters.clone())
            .unwrap_or_default()
    }

    /// Effective decision threshold of the active backend.
    pub fn threshold(&self) -> Option<f64> {
        let mut inner = self.lock()?;
        let kind = inner.settings.backend;
        inner.recognizer(kind).ok().map(|r| r.threshold())
    }

    /// Cost of a training call on the active backend.
    pub fn training_cost_hint(&self) -> TrainingCostHint {
        self.active_backend().training_cost()
    }

    /// Edge length face crops should have before they are handed in.
    pub fn recommended_image_size(&self) -> u32 {
        MAX_FACE_SIZE
    }

    // --- Maintenance ---

    pub fn integrity_check(&self) -> bool {
        let Some(inner) = self.lock() else {
            return false;
        };
        match inner.store.integrity_check() {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(error = %e, "integrity check failed");
                false
            }
        }
    }

    pub fn vacuum(&self) -> Result<(), FacesError> {
        let mut inner = self.lock_or_err()?;
        inner.store.vacuum()?;
        Ok(())
    }
}

fn is_known_parameter(key: &str) -> bool {
    key == PARAM_THRESHOLD || key == PARAM_ACCURACY
}

impl Inner {
    /// Loaded recognizer for `kind`, loading it from the store on first use.
    fn recognizer(&mut self, kind: BackendKind) -> Result<&mut Box<dyn Recognizer>, FacesError> {
        match self.recognizers.entry(kind) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let snapshot = self.store.load_model(kind)?;
                let mut none = None;
                let extractor = if kind == BackendKind::Dnn { &mut self.extractor } else { &mut none };
                let recognizer = create_recognizer(kind, &self.settings, snapshot, extractor)?;
                Ok(entry.insert(recognizer))
            }
        }
    }

    fn unload(&mut self, kind: BackendKind) {
        if let Some(mut recognizer) = self.recognizers.remove(&kind) {
            if let Some(extractor) = recognizer.take_extractor() {
                self.extractor = Some(extractor);
            }
            tracing::debug!(backend = %kind, "recognizer unloaded");
        }
    }

    fn unload_all(&mut self) {
        for kind in BackendKind::ALL {
            self.unload(kind);
        }
    }

    fn update_attributes(
        &mut self,
        id: IdentityId,
        update: impl FnOnce(&mut Attributes),
    ) -> Result<Identity, FacesError> {
        let mut identity = self
            .registry
            .get(id)
            .cloned()
            .ok_or(FacesError::IdentityNotFound(id))?;
        update(&mut identity.attributes);
        self.store.update_identity(&identity)?;
        self.registry.insert(identity.clone());
        tracing::debug!(id = %id, attributes = identity.attributes.len(), "identity updated");
        Ok(identity)
    }

    fn recognize(&mut self, images: &[DynamicImage]) -> Vec<Option<Identity>> {
        let kind = self.settings.backend;
        let recognizer = match self.recognizer(kind) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(backend = %kind, error = %e, "cannot load recognizer");
                return vec![None; images.len()];
            }
        };

        let labels: Vec<Option<IdentityId>> = images
            .iter()
            .map(|image| {
                let face = recognizer.prepare(image);
                recognizer.recognize(&face)
            })
            .collect();

        labels
            .into_iter()
            .map(|label| label.and_then(|id| self.registry.get(id).cloned()))
            .collect()
    }

    fn train_identity(&mut self, identity: &Identity, images: &[DynamicImage], context: &str) -> Result<bool, FacesError> {
        if self.registry.get(identity.id).is_none() {
            return Err(FacesError::IdentityNotFound(identity.id));
        }
        tracing::debug!(id = %identity.id, images = images.len(), "training identity");
        let labels = vec![identity.id; images.len()];
        self.train_batch(images, &labels, context)
    }

    /// Prepare, train and persist one labeled batch on the active backend.
    fn train_batch(&mut self, images: &[DynamicImage], labels: &[IdentityId], context: &str) -> Result<bool, FacesError> {
        let kind = self.settings.backend;
        let recognizer = self.recognizer(kind)?;

        let faces: Vec<PreparedFace> = images.iter().map(|image| recognizer.prepare(image)).collect();
        let trained = recognizer.train(&faces, labels, context);
        if trained {
            self.persist(kind);
        }
        Ok(trained)
    }

    /// Write a recognizer's new samples and state to the store.
    ///
    /// Failures are logged; the unsaved samples stay pending and go out with
    /// the next successful write.
    fn persist(&mut self, kind: BackendKind) {
        let Some(recognizer) = self.recognizers.get_mut(&kind) else {
            return;
        };
        let snapshot = recognizer.pending_snapshot();
        if snapshot.samples.is_empty() && snapshot.state.is_empty() {
            return;
        }
        match self.store.save_model(kind, &snapshot) {
            Ok(row_ids) => {
                recognizer.mark_persisted(&row_ids);
                tracing::debug!(backend = %kind, samples = row_ids.len(), "model persisted");
            }
            Err(e) => {
                tracing::error!(backend = %kind, error = %e, pending = snapshot.samples.len(), "failed to persist model");
            }
        }
    }

    fn set_parameter(&mut self, key: &str, value: f64) -> Result<(), FacesError> {
        if !is_known_parameter(key) {
            return Err(FacesError::UnknownParameter(key.to_string()));
        }
        let kind = self.settings.backend;
        self.settings.set_threshold_setting(kind, value);
        if let Some(recognizer) = self.recognizers.get_mut(&kind) {
            recognizer.set_threshold(value);
        }
        self.parameters.insert(key.to_string(), value);
        tracing::info!(backend = %kind, key, value, "parameter set");
        Ok(())
    }
}

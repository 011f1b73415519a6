//! Persistence contract consumed by the recognition database.
//!
//! The relational engine lives elsewhere (see `likeness-store`); this module
//! only fixes the operations the core needs and ships an in-memory
//! implementation for ephemeral databases and tests.

use crate::codec::{CodecError, MatrixBlob};
use crate::types::{Attributes, BackendKind, Identity, IdentityId};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),
    #[error("blob format version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// One persisted training sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSample {
    /// Row ID once durable; `None` for samples still to be inserted.
    pub row_id: Option<i64>,
    pub label: IdentityId,
    pub context: String,
    pub feature: MatrixBlob,
}

/// Everything a backend persists: its samples plus named derived arrays
/// (mean, basis, feature parameters).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSnapshot {
    pub samples: Vec<StoredSample>,
    pub state: Vec<(String, MatrixBlob)>,
}

impl ModelSnapshot {
    pub fn state(&self, name: &str) -> Option<&MatrixBlob> {
        self.state
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, blob)| blob)
    }

    pub fn pending(&self) -> usize {
        self.samples.iter().filter(|s| s.row_id.is_none()).count()
    }
}

/// Narrow persistence contract: identity CRUD plus per-backend model rows.
pub trait FaceStore: Send {
    /// Create an identity with its attributes in one step and return its ID.
    ///
    /// Nothing is stored if any part of the write fails.
    fn add_identity(&mut self, attributes: &Attributes) -> Result<IdentityId, StoreError>;

    /// Replace the stored attributes of an identity.
    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError>;

    /// Delete an identity and every training sample labeled with it, in all backends.
    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StoreError>;

    fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Load a backend's model, or `None` if nothing was ever saved.
    fn load_model(&self, kind: BackendKind) -> Result<Option<ModelSnapshot>, StoreError>;

    /// Insert the snapshot's samples that have no row ID yet, in order, and
    /// replace the backend's state arrays if the snapshot carries any.
    ///
    /// Returns the new row IDs in the order of the inserted samples.
    fn save_model(&mut self, kind: BackendKind, snapshot: &ModelSnapshot) -> Result<Vec<i64>, StoreError>;

    /// Delete samples of `kind`, optionally restricted to identities and/or a context.
    fn clear_training(
        &mut self,
        kind: BackendKind,
        identities: Option<&[IdentityId]>,
        context: Option<&str>,
    ) -> Result<(), StoreError>;

    fn integrity_check(&self) -> Result<bool, StoreError>;

    fn vacuum(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryModel {
    samples: Vec<StoredSample>,
    state: Vec<(String, MatrixBlob)>,
    saved: bool,
}

/// Non-durable [`FaceStore`] kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    next_identity: i64,
    next_row: i64,
    identities: BTreeMap<IdentityId, Attributes>,
    models: BTreeMap<&'static str, MemoryModel>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn model_mut(&mut self, kind: BackendKind) -> &mut MemoryModel {
        self.models.entry(kind.identifier()).or_default()
    }

    fn remove_samples(&mut self, kind: BackendKind, keep: impl Fn(&StoredSample) -> bool) {
        let model = self.model_mut(kind);
        let before = model.samples.len();
        model.samples.retain(|s| keep(s));
        if model.samples.len() != before {
            model.state.clear();
        }
    }
}

impl FaceStore for MemoryStore {
    fn add_identity(&mut self, attributes: &Attributes) -> Result<IdentityId, StoreError> {
        self.next_identity += 1;
        let id = IdentityId(self.next_identity);
        self.identities.insert(id, attributes.clone());
        Ok(id)
    }

    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let attrs = self
            .identities
            .get_mut(&identity.id)
            .ok_or(StoreError::IdentityNotFound(identity.id))?;
        *attrs = identity.attributes.clone();
        Ok(())
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StoreError> {
        self.identities.remove(&id);
        for kind in BackendKind::ALL {
            self.remove_samples(kind, |s| s.label != id);
        }
        Ok(())
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self
            .identities
            .iter()
            .map(|(id, attrs)| Identity::new(*id, attrs.clone()))
            .collect())
    }

    fn load_model(&self, kind: BackendKind) -> Result<Option<ModelSnapshot>, StoreError> {
        Ok(self
            .models
            .get(kind.identifier())
            .filter(|m| m.saved || !m.samples.is_empty())
            .map(|m| ModelSnapshot {
                samples: m.samples.clone(),
                state: m.state.clone(),
            }))
    }

    fn save_model(&mut self, kind: BackendKind, snapshot: &ModelSnapshot) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::with_capacity(snapshot.pending());
        let mut next_row = self.next_row;
        let model = self.model_mut(kind);
        for sample in snapshot.samples.iter().filter(|s| s.row_id.is_none()) {
            next_row += 1;
            model.samples.push(StoredSample {
                row_id: Some(next_row),
                ..sample.clone()
            });
            ids.push(next_row);
        }
        if !snapshot.state.is_empty() {
            model.state = snapshot.state.clone();
        }
        model.saved = true;
        self.next_row = next_row;
        Ok(ids)
    }

    fn clear_training(
        &mut self,
        kind: BackendKind,
        identities: Option<&[IdentityId]>,
        context: Option<&str>,
    ) -> Result<(), StoreError> {
        self.remove_samples(kind, |s| {
            let id_match = identities.map_or(true, |ids| ids.contains(&s.label));
            let ctx_match = context.map_or(true, |c| s.context == c);
            !(id_match && ctx_match)
        });
        Ok(())
    }

    fn integrity_check(&self) -> Result<bool, StoreError> {
        Ok(self.models.values().all(|m| {
            m.samples
                .iter()
                .all(|s| self.identities.contains_key(&s.label))
        }))
    }

    fn vacuum(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

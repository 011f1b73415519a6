use crate::schema::{backend_error, migrate};
use likeness_core::codec::{compress, decompress, ElementType, MatrixBlob};
use likeness_core::{
    Attributes, BackendKind, FaceStore, Identity, IdentityId, ModelSnapshot, StoreError, StoredSample,
};
use rusqlite::{params, Connection, Row, Transaction};
use std::collections::BTreeMap;
use std::path::Path;

/// [`FaceStore`] backed by a SQLite database.
///
/// Samples and identity attributes hang off `Identities` with
/// `ON DELETE CASCADE`; deleting samples of a backend also drops its
/// `ModelState` rows so the next load refits.
#[derive(Debug)]
pub struct SqliteStore {
    con: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let con = Connection::open(path).map_err(backend_error)?;
        migrate(&con)?;
        tracing::info!(path = %path.display(), "face database opened");
        Ok(Self { con })
    }

    // for testing
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let con = Connection::open_in_memory().map_err(backend_error)?;
        migrate(&con)?;
        Ok(Self { con })
    }

    fn identity_exists(&self, id: IdentityId) -> Result<bool, StoreError> {
        let count: i64 = self
            .con
            .query_row(
                "SELECT COUNT(*) FROM Identities WHERE id = ?1",
                [id.id()],
                |row| row.get(0),
            )
            .map_err(backend_error)?;
        Ok(count > 0)
    }
}

/// Replace the attribute rows of `id`, keeping the order of `attributes`.
fn write_attributes(tx: &Transaction<'_>, id: IdentityId, attributes: &Attributes) -> Result<(), StoreError> {
    tx.execute("DELETE FROM IdentityAttributes WHERE identity = ?1", [id.id()])
        .map_err(backend_error)?;

    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO IdentityAttributes (identity, attribute, value)
            VALUES (?1, ?2, ?3)",
        )
        .map_err(backend_error)?;
    for (key, value) in attributes.iter() {
        stmt.execute(params![id.id(), key, value])
            .map_err(backend_error)?;
    }
    Ok(())
}

/// Columns `type, nrows, ncols, data` starting at `first`.
fn blob_from_row(row: &Row<'_>, first: usize) -> Result<MatrixBlob, StoreError> {
    let tag: i32 = row.get(first).map_err(backend_error)?;
    let rows: i64 = row.get(first + 1).map_err(backend_error)?;
    let cols: i64 = row.get(first + 2).map_err(backend_error)?;
    let data: Vec<u8> = row.get(first + 3).map_err(backend_error)?;

    Ok(MatrixBlob {
        element_type: ElementType::from_tag(tag)?,
        rows: usize::try_from(rows).map_err(|e| StoreError::Backend(Box::new(e)))?,
        cols: usize::try_from(cols).map_err(|e| StoreError::Backend(Box::new(e)))?,
        bytes: decompress(&data)?,
    })
}

impl FaceStore for SqliteStore {
    fn add_identity(&mut self, attributes: &Attributes) -> Result<IdentityId, StoreError> {
        let tx = self.con.transaction().map_err(backend_error)?;
        tx.execute("INSERT INTO Identities DEFAULT VALUES", [])
            .map_err(backend_error)?;
        let id = IdentityId(tx.last_insert_rowid());
        write_attributes(&tx, id, attributes)?;
        tx.commit().map_err(backend_error)?;
        Ok(id)
    }

    fn update_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        if !self.identity_exists(identity.id)? {
            return Err(StoreError::IdentityNotFound(identity.id));
        }

        let tx = self.con.transaction().map_err(backend_error)?;
        write_attributes(&tx, identity.id, &identity.attributes)?;
        tx.commit().map_err(backend_error)?;
        Ok(())
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StoreError> {
        let tx = self.con.transaction().map_err(backend_error)?;
        {
            let mut stmt = tx
                .prepare_cached("SELECT DISTINCT backend FROM FaceSamples WHERE identity = ?1")
                .map_err(backend_error)?;
            let backends = stmt
                .query_map([id.id()], |row| row.get::<_, String>(0))
                .map_err(backend_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend_error)?;

            for backend in backends {
                tx.execute("DELETE FROM ModelState WHERE backend = ?1", [&backend])
                    .map_err(backend_error)?;
            }

            // Attributes and samples go with the identity row.
            tx.execute("DELETE FROM Identities WHERE id = ?1", [id.id()])
                .map_err(backend_error)?;
        }
        tx.commit().map_err(backend_error)?;
        tracing::debug!(id = %id, "identity deleted from store");
        Ok(())
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut attributes: BTreeMap<i64, Attributes> = BTreeMap::new();

        let mut stmt = self
            .con
            .prepare("SELECT id FROM Identities ORDER BY id ASC")
            .map_err(backend_error)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(backend_error)?;
        for id in ids {
            attributes.insert(id.map_err(backend_error)?, Attributes::new());
        }

        let mut stmt = self
            .con
            .prepare(
                "SELECT identity, attribute, value
                FROM IdentityAttributes
                ORDER BY id ASC",
            )
            .map_err(backend_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(backend_error)?;
        for row in rows {
            let (id, key, value) = row.map_err(backend_error)?;
            if let Some(attrs) = attributes.get_mut(&id) {
                attrs.insert(key, value);
            }
        }

        Ok(attributes
            .into_iter()
            .map(|(id, attrs)| Identity::new(IdentityId(id), attrs))
            .collect())
    }

    fn load_model(&self, kind: BackendKind) -> Result<Option<ModelSnapshot>, StoreError> {
        let backend = kind.identifier();

        let mut stmt = self
            .con
            .prepare(
                "SELECT id, identity, context, type, nrows, ncols, data
                FROM FaceSamples
                WHERE backend = ?1
                ORDER BY id ASC",
            )
            .map_err(backend_error)?;
        let mut rows = stmt.query([backend]).map_err(backend_error)?;
        let mut samples = Vec::new();
        while let Some(row) = rows.next().map_err(backend_error)? {
            samples.push(StoredSample {
                row_id: Some(row.get(0).map_err(backend_error)?),
                label: IdentityId(row.get(1).map_err(backend_error)?),
                context: row.get(2).map_err(backend_error)?,
                feature: blob_from_row(row, 3)?,
            });
        }

        let mut stmt = self
            .con
            .prepare(
                "SELECT name, type, nrows, ncols, data
                FROM ModelState
                WHERE backend = ?1
                ORDER BY name ASC",
            )
            .map_err(backend_error)?;
        let mut rows = stmt.query([backend]).map_err(backend_error)?;
        let mut state = Vec::new();
        while let Some(row) = rows.next().map_err(backend_error)? {
            let name: String = row.get(0).map_err(backend_error)?;
            state.push((name, blob_from_row(row, 1)?));
        }

        if samples.is_empty() && state.is_empty() {
            return Ok(None);
        }
        tracing::debug!(backend, samples = samples.len(), state = state.len(), "model loaded");
        Ok(Some(ModelSnapshot { samples, state }))
    }

    fn save_model(&mut self, kind: BackendKind, snapshot: &ModelSnapshot) -> Result<Vec<i64>, StoreError> {
        let backend = kind.identifier();
        let created_at = chrono::Utc::now().to_rfc3339();
        let mut row_ids = Vec::with_capacity(snapshot.pending());

        let tx = self.con.transaction().map_err(backend_error)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO FaceSamples (backend, identity, context, type, nrows, ncols, data, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(backend_error)?;
            for sample in snapshot.samples.iter().filter(|s| s.row_id.is_none()) {
                let blob = &sample.feature;
                stmt.execute(params![
                    backend,
                    sample.label.id(),
                    sample.context,
                    blob.element_type.tag(),
                    blob.rows as i64,
                    blob.cols as i64,
                    compress(&blob.bytes)?,
                    created_at,
                ])
                .map_err(backend_error)?;
                row_ids.push(tx.last_insert_rowid());
            }

            if !snapshot.state.is_empty() {
                tx.execute("DELETE FROM ModelState WHERE backend = ?1", [backend])
                    .map_err(backend_error)?;
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO ModelState (backend, name, type, nrows, ncols, data)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(backend_error)?;
                for (name, blob) in &snapshot.state {
                    stmt.execute(params![
                        backend,
                        name,
                        blob.element_type.tag(),
                        blob.rows as i64,
                        blob.cols as i64,
                        compress(&blob.bytes)?,
                    ])
                    .map_err(backend_error)?;
                }
            }
        }
        tx.commit().map_err(backend_error)?;

        tracing::debug!(backend, inserted = row_ids.len(), state = snapshot.state.len(), "model saved");
        Ok(row_ids)
    }

    fn clear_training(
        &mut self,
        kind: BackendKind,
        identities: Option<&[IdentityId]>,
        context: Option<&str>,
    ) -> Result<(), StoreError> {
        let backend = kind.identifier();
        let tx = self.con.transaction().map_err(backend_error)?;
        let mut deleted = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "DELETE FROM FaceSamples
                    WHERE backend = ?1
                        AND (?2 IS NULL OR identity = ?2)
                        AND (?3 IS NULL OR context = ?3)",
                )
                .map_err(backend_error)?;
            match identities {
                Some(ids) => {
                    for id in ids {
                        deleted += stmt
                            .execute(params![backend, Some(id.id()), context])
                            .map_err(backend_error)?;
                    }
                }
                None => {
                    deleted += stmt
                        .execute(params![backend, None::<i64>, context])
                        .map_err(backend_error)?;
                }
            }

            if deleted > 0 {
                tx.execute("DELETE FROM ModelState WHERE backend = ?1", [backend])
                    .map_err(backend_error)?;
            }
        }
        tx.commit().map_err(backend_error)?;

        tracing::debug!(backend, deleted, context, "training cleared");
        Ok(())
    }

    fn integrity_check(&self) -> Result<bool, StoreError> {
        let mut stmt = self
            .con
            .prepare("PRAGMA integrity_check")
            .map_err(backend_error)?;
        let messages = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend_error)?;
        let intact = messages.len() == 1 && messages[0] == "ok";
        if !intact {
            tracing::warn!(?messages, "integrity check reported problems");
        }

        let mut stmt = self
            .con
            .prepare("PRAGMA foreign_key_check")
            .map_err(backend_error)?;
        let dangling = stmt
            .query_map([], |_| Ok(()))
            .map_err(backend_error)?
            .count();
        if dangling > 0 {
            tracing::warn!(dangling, "foreign key violations found");
        }

        Ok(intact && dangling == 0)
    }

    fn vacuum(&mut self) -> Result<(), StoreError> {
        self.con.execute_batch("VACUUM").map_err(backend_error)?;
        tracing::info!("face database vacuumed");
        Ok(())
    }
}

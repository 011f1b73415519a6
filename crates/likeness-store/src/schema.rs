use likeness_core::{StoreError, BLOB_FORMAT_VERSION};
use rusqlite::{params, Connection, OptionalExtension};

/// Version of the table layout below.
pub const SCHEMA_VERSION: u32 = 1;

const SETTING_SCHEMA_VERSION: &str = "SchemaVersion";
const SETTING_BLOB_VERSION: &str = "BlobFormatVersion";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Settings (
    keyword TEXT NOT NULL PRIMARY KEY,
    value   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS IdentityAttributes (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    identity  INTEGER NOT NULL REFERENCES Identities(id) ON DELETE CASCADE,
    attribute TEXT NOT NULL,
    value     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS IdentityAttributesIndex ON IdentityAttributes (identity);

CREATE TABLE IF NOT EXISTS FaceSamples (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    backend    TEXT NOT NULL,
    identity   INTEGER NOT NULL REFERENCES Identities(id) ON DELETE CASCADE,
    context    TEXT NOT NULL DEFAULT '',
    type       INTEGER NOT NULL,
    nrows      INTEGER NOT NULL,
    ncols      INTEGER NOT NULL,
    data       BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS FaceSamplesIndex ON FaceSamples (backend, identity);

CREATE TABLE IF NOT EXISTS ModelState (
    backend TEXT NOT NULL,
    name    TEXT NOT NULL,
    type    INTEGER NOT NULL,
    nrows   INTEGER NOT NULL,
    ncols   INTEGER NOT NULL,
    data    BLOB NOT NULL,
    PRIMARY KEY (backend, name)
);
";

pub(crate) fn backend_error(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

/// Create missing tables and check the recorded formats.
///
/// A database written with a newer blob format is refused.
pub(crate) fn migrate(con: &Connection) -> Result<(), StoreError> {
    con.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(backend_error)?;
    con.execute_batch(SCHEMA).map_err(backend_error)?;

    match read_version(con, SETTING_BLOB_VERSION)? {
        Some(found) if found > BLOB_FORMAT_VERSION => {
            return Err(StoreError::UnsupportedVersion {
                found,
                supported: BLOB_FORMAT_VERSION,
            });
        }
        Some(found) if found == BLOB_FORMAT_VERSION => {}
        found => {
            tracing::info!(?found, version = BLOB_FORMAT_VERSION, "recording blob format version");
            write_version(con, SETTING_BLOB_VERSION, BLOB_FORMAT_VERSION)?;
        }
    }

    if read_version(con, SETTING_SCHEMA_VERSION)?.is_none() {
        write_version(con, SETTING_SCHEMA_VERSION, SCHEMA_VERSION)?;
    }

    Ok(())
}

pub(crate) fn read_version(con: &Connection, keyword: &str) -> Result<Option<u32>, StoreError> {
    let value: Option<String> = con
        .query_row(
            "SELECT value FROM Settings WHERE keyword = ?1",
            [keyword],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend_error)?;

    match value {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|e| StoreError::Backend(Box::new(e))),
        None => Ok(None),
    }
}

pub(crate) fn write_version(con: &Connection, keyword: &str, version: u32) -> Result<(), StoreError> {
    con.execute(
        "INSERT INTO Settings (keyword, value) VALUES (?1, ?2)
        ON CONFLICT(keyword) DO UPDATE SET value = excluded.value",
        params![keyword, version.to_string()],
    )
    .map_err(backend_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let con = Connection::open_in_memory().unwrap();
        migrate(&con).unwrap();
        migrate(&con).unwrap();
        assert_eq!(read_version(&con, SETTING_BLOB_VERSION).unwrap(), Some(BLOB_FORMAT_VERSION));
        assert_eq!(read_version(&con, SETTING_SCHEMA_VERSION).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_newer_blob_format_is_refused() {
        let con = Connection::open_in_memory().unwrap();
        migrate(&con).unwrap();
        write_version(&con, SETTING_BLOB_VERSION, BLOB_FORMAT_VERSION + 1).unwrap();
        assert!(matches!(
            migrate(&con),
            Err(StoreError::UnsupportedVersion { found, supported })
                if found == BLOB_FORMAT_VERSION + 1 && supported == BLOB_FORMAT_VERSION
        ));
    }
}

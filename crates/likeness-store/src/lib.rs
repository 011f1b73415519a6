//! likeness-store: SQLite persistence for the recognition database.
//!
//! Implements [`likeness_core::FaceStore`]: identities with multi-valued
//! attributes, per-backend training samples (zlib-compressed matrix blobs)
//! and named model-state arrays.

mod schema;
mod sqlite;

pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStore;

use image::{DynamicImage, GrayImage, Luma};
use likeness_core::{
    Attributes, BackendKind, FaceStore, RecognitionDatabase, RecognitionSettings, StoreError,
    BLOB_FORMAT_VERSION,
};
use likeness_store::SqliteStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tempfile::TempDir;

fn face(brightness: u8, blemish: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| {
        let dx = x as i32 - 32;
        let dy = y as i32 - 30;
        let mut v = 180 - ((dx * dx + dy * dy) / 12).min(150);
        if (y as i32 - 24).abs() < 4 && ((x as i32 - 22).abs() < 5 || (x as i32 - 42).abs() < 5) {
            v -= 25;
        }
        if x == blemish && y == blemish {
            v += 3;
        }
        Luma([(v.max(0) as u8).saturating_add(brightness)])
    }))
}

fn stripes(period: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| {
        Luma([if (x / period + y / (period + 1)) % 2 == 0 { 40 } else { 200 }])
    }))
}

fn noise(seed: u64) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(seed);
    DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |_, _| Luma([rng.gen()])))
}

fn training_set() -> Vec<DynamicImage> {
    (0..5).map(|i| face(i * 4, 10 + i as u32 * 7)).collect()
}

fn open(path: &Path, backend: BackendKind) -> RecognitionDatabase {
    let settings = RecognitionSettings {
        backend,
        ..RecognitionSettings::default()
    };
    RecognitionDatabase::open(SqliteStore::open(path), settings)
}

#[test]
fn lbph_training_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");

    let alice = {
        let db = open(&path, BackendKind::Lbph);
        assert!(db.is_available());
        let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
        assert!(db.train(&alice, &training_set(), "session-1").unwrap());
        alice
    };

    let db = open(&path, BackendKind::Lbph);
    assert_eq!(db.all_identities(), vec![alice.clone()]);
    assert_eq!(db.trained_samples().unwrap(), 5);
    assert_eq!(db.recognize_face(&face(20, 10)).map(|i| i.id), Some(alice.id));
    assert_eq!(db.recognize_face(&noise(3)), None);

    // Incremental: new samples append to the stored ones.
    assert!(db.train(&alice, &[face(1, 40)], "session-2").unwrap());
    drop(db);
    let db = open(&path, BackendKind::Lbph);
    assert_eq!(db.trained_samples().unwrap(), 6);
}

#[test]
fn subspace_models_survive_reopen() {
    for kind in [BackendKind::EigenFace, BackendKind::FisherFace] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("faces.db");

        let (alice, bob) = {
            let db = open(&path, kind);
            let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
            let bob = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();
            let mut provider = likeness_core::SimpleTrainingDataProvider::new(alice.id, training_set());
            provider.add(bob.id, vec![stripes(4), stripes(6), stripes(9)]);
            let trained = db
                .train_with_provider(&[alice.clone(), bob.clone()], &mut provider, "batch")
                .unwrap();
            assert_eq!(trained, 2, "{kind}");
            (alice, bob)
        };

        let db = open(&path, kind);
        assert_eq!(db.trained_samples().unwrap(), 8, "{kind}");
        assert_eq!(db.recognize_face(&stripes(9)).map(|i| i.id), Some(bob.id), "{kind}");
        assert_eq!(db.recognize_face(&face(0, 10)).map(|i| i.id), Some(alice.id), "{kind}");
    }
}

#[test]
fn subspace_saves_do_not_grow_with_training_calls() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");
    let db = open(&path, BackendKind::EigenFace);
    let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    let bob = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();

    let stored = |path: &Path| -> (i64, i64) {
        let con = rusqlite::Connection::open(path).unwrap();
        let count = |sql: &str| con.query_row(sql, [], |row| row.get::<_, i64>(0)).unwrap();
        (
            count("SELECT COUNT(*) FROM FaceSamples WHERE backend = 'eigenfaces'"),
            count("SELECT COUNT(*) FROM ModelState WHERE backend = 'eigenfaces'"),
        )
    };

    assert!(db.train(&alice, &training_set(), "").unwrap());
    assert_eq!(stored(&path), (5, 0));
    for period in [4, 6, 9] {
        assert!(db.train(&bob, &[stripes(period)], "").unwrap());
    }
    assert_eq!(stored(&path), (8, 0));

    drop(db);
    let db = open(&path, BackendKind::EigenFace);
    assert_eq!(db.recognize_face(&stripes(6)).map(|i| i.id), Some(bob.id));
}

#[test]
fn failed_identity_insert_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");
    let db = open(&path, BackendKind::Lbph);

    let con = rusqlite::Connection::open(&path).unwrap();
    con.execute_batch(
        "CREATE TRIGGER reject_attributes BEFORE INSERT ON IdentityAttributes
        BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    )
    .unwrap();
    assert!(db.add_identity(&Attributes::new().with("name", "Alice")).is_err());
    assert!(db.all_identities().is_empty());

    con.execute_batch("DROP TRIGGER reject_attributes").unwrap();
    drop(con);
    drop(db);

    let db = open(&path, BackendKind::Lbph);
    assert!(db.all_identities().is_empty());
    let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    assert!(alice.uuid().is_some());
    assert!(db.all_identities().iter().all(|i| i.uuid().is_some()));
}

#[test]
fn deleting_identity_cascades_in_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");

    let db = open(&path, BackendKind::Lbph);
    let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    let bob = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();
    db.train(&alice, &training_set(), "").unwrap();
    db.train(&bob, &[stripes(4), stripes(5)], "").unwrap();
    db.delete_identity(alice.id).unwrap();
    assert!(db.integrity_check());
    drop(db);

    let store = SqliteStore::open(&path).unwrap();
    let snapshot = store.load_model(BackendKind::Lbph).unwrap().unwrap();
    assert_eq!(snapshot.samples.len(), 2);
    assert!(snapshot.samples.iter().all(|s| s.label == bob.id));
    assert_eq!(store.identities().unwrap().len(), 1);
}

#[test]
fn identity_uuid_is_idempotent_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");

    let first = {
        let db = open(&path, BackendKind::Lbph);
        db.add_identity(&Attributes::new().with("uuid", "X").with("name", "A"))
            .unwrap()
    };
    let db = open(&path, BackendKind::Lbph);
    let again = db
        .add_identity(&Attributes::new().with("uuid", "X").with("name", "B"))
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(db.all_identities().len(), 1);
}

#[test]
fn clear_training_persists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");

    let db = open(&path, BackendKind::Lbph);
    let alice = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    db.train(&alice, &training_set()[..3], "import").unwrap();
    db.train(&alice, &training_set()[3..], "manual").unwrap();
    db.clear_training(&[alice.id], Some("import")).unwrap();
    assert_eq!(db.trained_samples().unwrap(), 2);
    drop(db);

    let db = open(&path, BackendKind::Lbph);
    assert_eq!(db.trained_samples().unwrap(), 2);
    db.vacuum().unwrap();
}

#[test]
fn newer_blob_format_degrades_the_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("faces.db");
    drop(SqliteStore::open(&path).unwrap());

    let con = rusqlite::Connection::open(&path).unwrap();
    con.execute(
        "UPDATE Settings SET value = ?1 WHERE keyword = 'BlobFormatVersion'",
        [(BLOB_FORMAT_VERSION + 1).to_string()],
    )
    .unwrap();
    drop(con);

    assert!(matches!(
        SqliteStore::open(&path),
        Err(StoreError::UnsupportedVersion { .. })
    ));
    let db = open(&path, BackendKind::Lbph);
    assert!(!db.is_available());
    assert!(db.all_identities().is_empty());
}

#[test]
fn unreachable_file_degrades_the_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing").join("faces.db");
    let db = open(&path, BackendKind::Lbph);
    assert!(!db.is_available());
    assert_eq!(db.recognize_faces(&[noise(1)]), vec![None]);
}

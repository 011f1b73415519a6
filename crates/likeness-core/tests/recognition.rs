use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use likeness_core::extractor::ExtractorError;
use likeness_core::{
    Attributes, BackendKind, Embedding, RecognitionDatabase, RecognitionSettings,
    SimpleTrainingDataProvider,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A smooth synthetic face: radial gradient plus a pair of darker "eyes".
fn alice(brightness: u8, blemish: u32) -> DynamicImage {
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

fn alice_training_set() -> Vec<DynamicImage> {
    (0..5).map(|i| alice(i * 4, 10 + i as u32 * 7)).collect()
}

#[test]
fn lbph_recognizes_near_duplicate_and_rejects_noise() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();

    assert!(db.train(&a, &alice_training_set(), "test").unwrap());

    let probe = alice(30, 10);
    assert_eq!(db.recognize_face(&probe).map(|i| i.id), Some(a.id));
    assert_eq!(db.recognize_face(&noise(7)), None);
}

#[test]
fn recognize_faces_keeps_one_slot_per_image() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    db.train(&a, &alice_training_set(), "test").unwrap();

    let results = db.recognize_faces(&[noise(1), alice(12, 10), noise(2)]);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_none());
    assert_eq!(results[1].as_ref().map(|i| i.id), Some(a.id));
    assert!(results[2].is_none());
}

#[test]
fn add_identity_with_same_uuid_is_idempotent() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let attrs = Attributes::new().with("uuid", "X").with("name", "A");
    let first = db.add_identity(&attrs).unwrap();
    let second = db
        .add_identity(&Attributes::new().with("uuid", "X").with("name", "Other"))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(second.name(), Some("A"));
    assert_eq!(db.all_identities().len(), 1);
    assert_eq!(db.find_identity("uuid", "X").map(|i| i.id), Some(first.id));
}

#[test]
fn delete_identity_cascades_to_training() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    let b = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();
    db.train(&a, &alice_training_set(), "test").unwrap();
    db.train(&b, &[stripes(4), stripes(5)], "test").unwrap();
    assert_eq!(db.trained_samples().unwrap(), 7);

    let probe = alice(8, 10);
    assert_eq!(db.recognize_face(&probe).map(|i| i.id), Some(a.id));

    db.delete_identity(a.id).unwrap();
    assert!(db.all_identities().iter().all(|i| i.id != a.id));
    assert_ne!(db.recognize_face(&probe).map(|i| i.id), Some(a.id));
    assert_eq!(db.trained_samples().unwrap(), 2);
}

#[test]
fn find_identity_by_prefers_uuid_then_names() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let a = db
        .add_identity(&Attributes::new().with("name", "Alice").with("fullName", "Alice Liddell"))
        .unwrap();
    let b = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();

    let uuid = b.uuid().unwrap().to_string();
    let query = Attributes::new().with("uuid", uuid).with("name", "Alice");
    assert_eq!(db.find_identity_by(&query).map(|i| i.id), Some(b.id));

    let query = Attributes::new().with("uuid", "missing").with("name", "Alice");
    assert!(db.find_identity_by(&query).is_none());

    let query = Attributes::new().with("name", "Bob").with("fullName", "Alice Liddell");
    assert_eq!(db.find_identity_by(&query).map(|i| i.id), Some(a.id));
}

#[test]
fn eigenfaces_and_fisherfaces_are_honored() {
    for kind in [BackendKind::EigenFace, BackendKind::FisherFace] {
        let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
        db.set_active_backend(kind);
        assert_eq!(db.active_backend(), kind);

        let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
        let b = db.add_identity(&Attributes::new().with("name", "Bob")).unwrap();
        let mut provider = SimpleTrainingDataProvider::new(a.id, alice_training_set());
        provider.add(b.id, vec![stripes(4), stripes(6), stripes(9)]);

        let trained = db.train_with_provider(&[a.clone(), b.clone()], &mut provider, "batch").unwrap();
        assert_eq!(trained, 2, "{kind}");
        assert_eq!(db.trained_samples().unwrap(), 8);

        assert_eq!(db.recognize_face(&stripes(6)).map(|i| i.id), Some(b.id), "{kind}");
        assert_eq!(db.recognize_face(&alice(0, 10)).map(|i| i.id), Some(a.id), "{kind}");
    }
}

#[test]
fn fisherfaces_needs_two_identities() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    db.set_active_backend(BackendKind::FisherFace);
    let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    assert!(!db.train(&a, &alice_training_set(), "x").unwrap());
    assert_eq!(db.trained_samples().unwrap(), 0);
}

#[test]
fn dnn_backend_uses_the_extractor() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    db.set_active_backend(BackendKind::Dnn);
    db.set_extractor(Box::new(|face: &RgbImage| -> Result<Embedding, ExtractorError> {
        let mut sums = [0.0f32; 3];
        for p in face.pixels() {
            for (c, sum) in sums.iter_mut().enumerate() {
                *sum += p.0[c] as f32;
            }
        }
        Ok(Embedding::new(sums.to_vec()))
    }));

    let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([220, 20, 20])));
    let blue = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([20, 20, 220])));
    let a = db.add_identity(&Attributes::new().with("name", "Red")).unwrap();
    let b = db.add_identity(&Attributes::new().with("name", "Blue")).unwrap();
    assert!(db.train(&a, &[red.clone()], "").unwrap());
    assert!(db.train(&b, &[blue.clone()], "").unwrap());

    assert_eq!(db.recognize_face(&red).map(|i| i.id), Some(a.id));
    db.set_parameter("threshold", 1.5).unwrap();
    assert_eq!(db.recognize_face(&red), None);
}

#[test]
fn clearing_by_context_keeps_other_contexts() {
    let db = RecognitionDatabase::in_memory(RecognitionSettings::default());
    let a = db.add_identity(&Attributes::new().with("name", "Alice")).unwrap();
    db.train(&a, &alice_training_set()[..2], "import").unwrap();
    db.train(&a, &alice_training_set()[2..], "manual").unwrap();
    assert_eq!(db.trained_samples().unwrap(), 5);

    db.clear_all_training(Some("import")).unwrap();
    assert_eq!(db.trained_samples().unwrap(), 3);
    assert!(db.integrity_check());
}

//! Sources of training images.

use crate::types::{Identity, IdentityId};
use image::DynamicImage;
use std::collections::HashMap;

/// Supplies the face images to train for an identity.
pub trait TrainingDataProvider {
    /// Images not yet trained for `identity`. Called once per identity per training run.
    fn new_images(&mut self, identity: &Identity) -> Vec<DynamicImage>;
}

/// Provider backed by images already in memory, keyed by identity.
#[derive(Default)]
pub struct SimpleTrainingDataProvider {
    images: HashMap<IdentityId, Vec<DynamicImage>>,
}

impl SimpleTrainingDataProvider {
    pub fn new(identity: IdentityId, images: Vec<DynamicImage>) -> Self {
        let mut provider = Self::default();
        provider.add(identity, images);
        provider
    }

    pub fn add(&mut self, identity: IdentityId, images: Vec<DynamicImage>) {
        self.images.entry(identity).or_default().extend(images);
    }
}

impl TrainingDataProvider for SimpleTrainingDataProvider {
    /// Hands over the queued images; a second call for the same identity yields nothing.
    fn new_images(&mut self, identity: &Identity) -> Vec<DynamicImage> {
        self.images.remove(&identity.id).unwrap_or_default()
    }
}

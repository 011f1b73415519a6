//! In-memory identity cache with attribute lookups.

use crate::types::{attribute, Attributes, Identity, IdentityId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    identities: BTreeMap<IdentityId, Identity>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// All identities in ID order.
    pub fn all(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.get(&id)
    }

    /// Insert or replace.
    pub fn insert(&mut self, identity: Identity) {
        self.identities.insert(identity.id, identity);
    }

    pub fn remove(&mut self, id: IdentityId) -> Option<Identity> {
        self.identities.remove(&id)
    }

    pub fn clear(&mut self) {
        self.identities.clear();
    }

    /// First identity with `value` among its values under `key`.
    pub fn find_by_attribute(&self, key: &str, value: &str) -> Option<&Identity> {
        self.identities
            .values()
            .find(|identity| identity.attributes.contains(key, value))
    }

    /// Best match for a set of attributes.
    ///
    /// A supplied `uuid` decides alone: if it matches nothing, nothing is
    /// returned. Otherwise `fullName` is tried, then `name`, then every other
    /// key in the order given. For each key, each supplied value is tried in turn.
    pub fn find_by_attributes(&self, attributes: &Attributes) -> Option<&Identity> {
        if let Some(uuid) = attributes.get(attribute::UUID).filter(|u| !u.is_empty()) {
            return self.find_by_attribute(attribute::UUID, uuid);
        }

        let mut order = vec![attribute::FULL_NAME, attribute::NAME];
        order.extend(
            attributes
                .keys()
                .into_iter()
                .filter(|k| ![attribute::UUID, attribute::FULL_NAME, attribute::NAME].contains(k)),
        );

        order.into_iter().find_map(|key| {
            attributes
                .get_all(key)
                .find_map(|value| self.find_by_attribute(key, value))
        })
    }
}

impl FromIterator<Identity> for IdentityRegistry {
    fn from_iter<T: IntoIterator<Item = Identity>>(iter: T) -> Self {
        Self {
            identities: iter.into_iter().map(|i| (i.id, i)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IdentityRegistry {
        [
            Identity::new(
                IdentityId(1),
                Attributes::new()
                    .with("uuid", "u-1")
                    .with("name", "Alice")
                    .with("name", "Ally")
                    .with("team", "red"),
            ),
            Identity::new(
                IdentityId(2),
                Attributes::new()
                    .with("uuid", "u-2")
                    .with("name", "Bob")
                    .with("fullName", "Robert Smith")
                    .with("team", "blue"),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_find_by_attribute_matches_any_value() {
        let r = registry();
        assert_eq!(r.find_by_attribute("name", "Ally").map(|i| i.id), Some(IdentityId(1)));
        assert_eq!(r.find_by_attribute("team", "blue").map(|i| i.id), Some(IdentityId(2)));
        assert!(r.find_by_attribute("name", "Carol").is_none());
    }

    #[test]
    fn test_uuid_short_circuits() {
        let r = registry();
        let query = Attributes::new().with("uuid", "u-9").with("name", "Alice");
        assert!(r.find_by_attributes(&query).is_none());

        let query = Attributes::new().with("uuid", "u-2").with("name", "Alice");
        assert_eq!(r.find_by_attributes(&query).map(|i| i.id), Some(IdentityId(2)));
    }

    #[test]
    fn test_empty_uuid_is_ignored() {
        let r = registry();
        let query = Attributes::new().with("uuid", "").with("name", "Bob");
        assert_eq!(r.find_by_attributes(&query).map(|i| i.id), Some(IdentityId(2)));
    }

    #[test]
    fn test_full_name_before_name() {
        let r = registry();
        let query = Attributes::new().with("name", "Alice").with("fullName", "Robert Smith");
        assert_eq!(r.find_by_attributes(&query).map(|i| i.id), Some(IdentityId(2)));
    }

    #[test]
    fn test_custom_keys_in_caller_order() {
        let r = registry();
        let query = Attributes::new().with("team", "blue").with("nick", "x");
        assert_eq!(r.find_by_attributes(&query).map(|i| i.id), Some(IdentityId(2)));
        let query = Attributes::new().with("nick", "x").with("team", "red");
        assert_eq!(r.find_by_attributes(&query).map(|i| i.id), Some(IdentityId(1)));
        assert!(r.find_by_attributes(&Attributes::new()).is_none());
    }

    #[test]
    fn test_insert_remove() {
        let mut r = registry();
        assert_eq!(r.len(), 2);
        r.remove(IdentityId(1));
        assert!(r.get(IdentityId(1)).is_none());
        r.insert(Identity::new(IdentityId(7), Attributes::new()));
        assert_eq!(r.all().iter().map(|i| i.id.id()).collect::<Vec<_>>(), vec![2, 7]);
    }
}

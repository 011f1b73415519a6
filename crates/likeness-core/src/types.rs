use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Database ID of an identity. Also the label attached to every training sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub i64);

impl IdentityId {
    pub fn id(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known attribute keys.
pub mod attribute {
    pub const UUID: &str = "uuid";
    pub const NAME: &str = "name";
    pub const FULL_NAME: &str = "fullName";
}

/// Ordered multi-valued attribute map.
///
/// A key may carry several values; insertion order is preserved because
/// composite lookups walk keys in the order the caller supplied them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<(String, String)>")]
pub struct Attributes {
    entries: Vec<(String, String)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a value under `key`, keeping any values already there.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace all values under `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut i = 0;
                self.entries.retain(|(k, _)| {
                    let keep = *k != key || i == first;
                    i += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// True if any value under `key` equals `value`.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.entries.iter().any(|(k, v)| k == key && v == value)
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.entries {
            if !keys.contains(&k.as_str()) {
                keys.push(k.as_str());
            }
        }
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append every pair of `other`, skipping pairs already present.
    pub fn unite(&mut self, other: &Attributes) {
        for (k, v) in other.iter() {
            if !self.contains(k, v) {
                self.insert(k, v);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl From<Vec<(String, String)>> for Attributes {
    fn from(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let keys = self.keys();
        let mut map = serializer.serialize_map(Some(keys.len()))?;
        for key in keys {
            let values: Vec<&str> = self.get_all(key).collect();
            map.serialize_entry(key, &values)?;
        }
        map.end()
    }
}

/// A person the system can recognize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: IdentityId,
    pub attributes: Attributes,
}

impl Identity {
    pub fn new(id: IdentityId, attributes: Attributes) -> Self {
        Self { id, attributes }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.attributes.get(attribute::UUID)
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.get(attribute::NAME)
    }
}

/// Recognition algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Lbph,
    EigenFace,
    FisherFace,
    Dnn,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Lbph,
        BackendKind::EigenFace,
        BackendKind::FisherFace,
        BackendKind::Dnn,
    ];

    /// Stable identifier, also the backend key in persisted tables.
    pub fn identifier(self) -> &'static str {
        match self {
            BackendKind::Lbph => "opencvlbph",
            BackendKind::EigenFace => "eigenfaces",
            BackendKind::FisherFace => "fisherfaces",
            BackendKind::Dnn => "dnn",
        }
    }

    /// Distance backends accept small scores; the embedding backend accepts large ones.
    pub fn is_similarity(self) -> bool {
        matches!(self, BackendKind::Dnn)
    }

    /// How much a training call costs relative to the samples it adds.
    pub fn training_cost(self) -> TrainingCostHint {
        match self {
            BackendKind::Lbph | BackendKind::Dnn => TrainingCostHint::Cheap,
            BackendKind::EigenFace | BackendKind::FisherFace => TrainingCostHint::Expensive,
        }
    }
}

/// Lets callers decide whether to train per image or collect a batch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingCostHint {
    /// Proportional to the new samples only.
    Cheap,
    /// Every call refits over all accumulated samples.
    Expensive,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recognition backend: {0}")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lbp" | "lbph" | "opencvlbph" => Ok(BackendKind::Lbph),
            "eigen" | "eigenface" | "eigenfaces" => Ok(BackendKind::EigenFace),
            "fisher" | "fisherface" | "fisherfaces" => Ok(BackendKind::FisherFace),
            "dnn" => Ok(BackendKind::Dnn),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Storage state of a training sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    /// In memory only.
    Created,
    /// Durable, with the database row ID.
    InDatabase(i64),
}

impl SampleStatus {
    pub fn from_row_id(row_id: Option<i64>) -> Self {
        match row_id {
            Some(id) => SampleStatus::InDatabase(id),
            None => SampleStatus::Created,
        }
    }

    pub fn row_id(self) -> Option<i64> {
        match self {
            SampleStatus::Created => None,
            SampleStatus::InDatabase(id) => Some(id),
        }
    }
}

/// One feature representation of one face, tagged with its identity.
#[derive(Debug, Clone)]
pub struct Sample<F> {
    pub feature: F,
    pub label: IdentityId,
    pub status: SampleStatus,
    pub context: String,
}

impl<F> Sample<F> {
    pub fn new(feature: F, label: IdentityId, context: &str) -> Self {
        Self {
            feature,
            label,
            status: SampleStatus::Created,
            context: context.to_string(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.status, SampleStatus::InDatabase(_))
    }
}

/// Face embedding vector produced by an external extractor (e.g. 128- or 512-dim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Nearest-neighbour result of a model query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: IdentityId,
    /// Distance (LBPH, Eigenfaces, Fisherfaces) or similarity (DNN).
    pub score: f64,
}

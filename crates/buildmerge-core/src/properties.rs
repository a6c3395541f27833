//! Property bags with provenance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Property pinning a request to one worker. Pinned requests never merge.
pub const SELECTED_SLAVE: &str = "selected_slave";

/// A property value together with the label of whatever set it.
///
/// Serialized as a `[value, source]` pair, which is also how the store
/// persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "(Value, String)", from = "(Value, String)")]
pub struct PropertyValue {
    pub value: Value,
    pub source: String,
}

impl From<PropertyValue> for (Value, String) {
    fn from(p: PropertyValue) -> Self {
        (p.value, p.source)
    }
}

impl From<(Value, String)> for PropertyValue {
    fn from((value, source): (Value, String)) -> Self {
        Self { value, source }
    }
}

/// Flat name -> (value, source) mapping owned by a buildset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value and source.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>, source: impl Into<String>) {
        self.0.insert(
            name.into(),
            PropertyValue {
                value: value.into(),
                source: source.into(),
            },
        );
    }

    /// Builder-style variant of [`Properties::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>, source: impl Into<String>) -> Self {
        self.set(name, value, source);
        self
    }

    /// Value of a property, without its source.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).map(|p| &p.value)
    }

    pub fn get_with_source(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Whether the request is pinned to a specific worker.
    pub fn has_selected_slave(&self) -> bool {
        self.contains(SELECTED_SLAVE)
    }

    /// Overlay every property of `other`, keeping `other`'s sources.
    pub fn update(&mut self, other: &Properties) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, PropertyValue)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

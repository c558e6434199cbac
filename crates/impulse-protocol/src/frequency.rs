//! Frequencies: the (entity, channel) routes an impulse is dispatched on.

use serde::{Deserialize, Serialize};

/// A single route.
///
/// `impulse_id` holds the message id the destination channel returned the
/// last time an impulse was sent through this route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frequency {
    entity: String,
    channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    impulse_id: Option<String>,
}

impl Frequency {
    /// Create a new frequency.
    #[must_use]
    pub fn new(entity: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            channel: channel.into(),
            impulse_id: None,
        }
    }

    /// Entity name.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Message id returned by the last successful send on this route.
    #[must_use]
    pub fn impulse_id(&self) -> Option<&str> {
        self.impulse_id.as_deref()
    }

    /// Record the message id returned by the destination channel.
    pub fn set_impulse_id(&mut self, id: impl Into<String>) {
        self.impulse_id = Some(id.into());
    }

    /// Whether this frequency addresses the given pair.
    #[must_use]
    pub fn matches(&self, entity: &str, channel: &str) -> bool {
        self.entity == entity && self.channel == channel
    }
}

/// An insertion-ordered set of frequencies, unique per (entity, channel).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<Frequency>")]
pub struct FrequencyCollection {
    items: Vec<Frequency>,
}

impl From<Vec<Frequency>> for FrequencyCollection {
    fn from(items: Vec<Frequency>) -> Self {
        let mut collection = Self::new();
        for item in items {
            collection.add(item);
        }
        collection
    }
}

impl FrequencyCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frequency.
    ///
    /// Returns `false` if the pair is already present.
    pub fn add(&mut self, frequency: Frequency) -> bool {
        if self.contains(frequency.entity(), frequency.channel()) {
            return false;
        }
        self.items.push(frequency);
        true
    }

    /// Check if the pair is present.
    #[must_use]
    pub fn contains(&self, entity: &str, channel: &str) -> bool {
        self.items.iter().any(|f| f.matches(entity, channel))
    }

    /// Look up the frequency for a pair.
    #[must_use]
    pub fn get(&self, entity: &str, channel: &str) -> Option<&Frequency> {
        self.items.iter().find(|f| f.matches(entity, channel))
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Frequency> {
        self.items.iter()
    }

    /// Iterate mutably in insertion order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Frequency> {
        self.items.iter_mut()
    }

    /// Number of frequencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Serialize for FrequencyCollection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.items.serialize(serializer)
    }
}

impl<'a> IntoIterator for &'a FrequencyCollection {
    type Item = &'a Frequency;
    type IntoIter = std::slice::Iter<'a, Frequency>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_is_a_set_of_pairs() {
        let mut frequencies = FrequencyCollection::new();
        assert!(frequencies.add(Frequency::new("app", "events")));
        assert!(frequencies.add(Frequency::new("app", "audit")));
        assert!(!frequencies.add(Frequency::new("app", "events")));

        assert_eq!(frequencies.len(), 2);
        assert!(frequencies.contains("app", "audit"));
        assert!(!frequencies.contains("other", "events"));
    }

    #[test]
    fn test_impulse_id_tracking() {
        let mut frequencies = FrequencyCollection::new();
        frequencies.add(Frequency::new("app", "events"));

        for frequency in frequencies.iter_mut() {
            frequency.set_impulse_id("m.1");
        }
        assert_eq!(
            frequencies.get("app", "events").and_then(Frequency::impulse_id),
            Some("m.1")
        );
    }

    #[test]
    fn test_deserialize_drops_duplicate_pairs() {
        let value = json!([
            {"entity": "app", "channel": "events"},
            {"entity": "app", "channel": "events", "impulseId": "m.9"},
            {"entity": "app", "channel": "audit"}
        ]);
        let frequencies: FrequencyCollection = serde_json::from_value(value).unwrap();
        assert_eq!(frequencies.len(), 2);
        assert_eq!(frequencies.get("app", "events").unwrap().impulse_id(), None);
    }
}

//! Emitter identity.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Emitter validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitterError {
    /// Identity is neither a string nor an object.
    #[error("Emitter identity must be a string or an object")]
    InvalidShape,

    /// Object identity without a string `id`.
    #[error("Emitter identity is missing a string `id`")]
    MissingId,

    /// Empty id.
    #[error("Emitter id cannot be empty")]
    EmptyId,
}

/// The logical sender of an impulse.
///
/// Two emitters are equal when their ids are equal; the remaining identity
/// attributes are carried along but do not take part in comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Emitter {
    id: String,
    attributes: Map<String, Value>,
}

impl Emitter {
    /// Build an emitter from a raw identity record.
    ///
    /// Accepts either a bare id string or an object carrying a non-empty
    /// string `id` plus any further attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity has the wrong shape.
    pub fn from_identity(identity: &Value) -> Result<Self, EmitterError> {
        match identity {
            Value::String(id) => Self::from_id(id.clone()),
            Value::Object(fields) => {
                let id = fields
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or(EmitterError::MissingId)?;
                let mut emitter = Self::from_id(id)?;
                emitter.attributes = fields
                    .iter()
                    .filter(|(key, _)| key.as_str() != "id")
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                Ok(emitter)
            }
            _ => Err(EmitterError::InvalidShape),
        }
    }

    /// Build an emitter from its id alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty.
    pub fn from_id(id: impl Into<String>) -> Result<Self, EmitterError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EmitterError::EmptyId);
        }
        Ok(Self {
            id,
            attributes: Map::new(),
        })
    }

    /// The emitter id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Extra identity attributes.
    #[must_use]
    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Identity equality.
    #[must_use]
    pub fn is_equal(&self, other: &Emitter) -> bool {
        self.id == other.id
    }
}

impl PartialEq for Emitter {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Eq for Emitter {}

impl TryFrom<Value> for Emitter {
    type Error = EmitterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_identity(&value)
    }
}

impl From<Emitter> for Value {
    fn from(emitter: Emitter) -> Value {
        let mut fields = emitter.attributes;
        fields.insert("id".to_string(), Value::String(emitter.id));
        Value::Object(fields)
    }
}

//! The impulse transport record and its typed import.
//!
//! Importing walks the record one nesting level at a time and checks every
//! known field against the kind it is allowed to hold. A field of the wrong
//! kind is dropped and listed in the [`ImportReport`]; the rest of the import
//! carries on. Absent and `null` fields are left at their defaults without
//! being reported.

use crate::frequency::FrequencyCollection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Record errors that stop an import altogether.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The root of the record is not an object.
    #[error("Impulse record must be an object, got {0}")]
    NotAnObject(ValueKind),

    /// Serialization failure.
    #[error("Record serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reply linkage: which impulse, emitter and emit this impulse answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyLink {
    /// Id of the impulse being replied to.
    pub impulse: Option<String>,
    /// Id of the emitter that sent it.
    pub emitter: Option<String>,
    /// Index in the original impulse's emit stack.
    pub stack: Option<u64>,
}

impl ReplyLink {
    /// Whether this impulse is a reply at all.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.impulse.is_some()
    }
}

/// Trace/debug options as they travel on the wire.
///
/// Payloads are carried as JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRecord {
    pub trace: bool,
    pub trace_content: Option<String>,
    pub debug: bool,
    pub debug_content: Option<String>,
}

/// Routing metadata as it travels on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoRecord {
    pub emitter: Option<String>,
    pub frequencies: FrequencyCollection,
    pub reply: ReplyLink,
    pub options: OptionsRecord,
    pub encryption: bool,
}

/// An impulse in transport form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpulseRecord {
    pub id: Option<String>,
    pub content: Value,
    pub history: Value,
    pub info: InfoRecord,
}

impl Default for ImpulseRecord {
    fn default() -> Self {
        Self {
            id: None,
            content: Value::Object(Map::new()),
            history: Value::Object(Map::new()),
            info: InfoRecord::default(),
        }
    }
}

/// JSON value kinds, for import diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Classify a value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Verdict on a single imported field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
}

/// One entry of an [`ImportReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOutcome {
    /// Dotted path of the field, e.g. `info.reply.stack`.
    pub path: String,
    pub verdict: Verdict,
}

/// Per-field result of an import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    fields: Vec<FieldOutcome>,
}

impl ImportReport {
    /// Create an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted field.
    pub fn accept(&mut self, path: impl Into<String>) {
        self.fields.push(FieldOutcome {
            path: path.into(),
            verdict: Verdict::Accepted,
        });
    }

    /// Record a rejected field.
    pub fn reject(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.fields.push(FieldOutcome {
            path: path.into(),
            verdict: Verdict::Rejected {
                reason: reason.into(),
            },
        });
    }

    /// Turn a previously accepted field into a rejection.
    ///
    /// Used when a later, stricter check refuses a value the schema let
    /// through.
    pub fn overrule(&mut self, path: &str, reason: impl Into<String>) {
        let reason = reason.into();
        match self.fields.iter_mut().find(|f| f.path == path) {
            Some(field) => field.verdict = Verdict::Rejected { reason },
            None => self.reject(path, reason),
        }
    }

    /// All outcomes in import order.
    #[must_use]
    pub fn fields(&self) -> &[FieldOutcome] {
        &self.fields
    }

    /// Paths of accepted fields.
    pub fn accepted(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.verdict == Verdict::Accepted)
            .map(|f| f.path.as_str())
    }

    /// Rejected fields.
    pub fn rejected(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.fields
            .iter()
            .filter(|f| matches!(f.verdict, Verdict::Rejected { .. }))
    }

    /// Whether any field was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected().next().is_none()
    }
}

/// Walks one object level, extracting typed fields into a report.
struct Level<'a> {
    fields: &'a Map<String, Value>,
    prefix: &'a str,
}

impl<'a> Level<'a> {
    fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Extract a field with `convert`; `expected` names the allowed kind.
    fn take<T>(
        &self,
        name: &str,
        expected: &str,
        report: &mut ImportReport,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Option<T> {
        let value = match self.fields.get(name) {
            None | Some(Value::Null) => return None,
            Some(value) => value,
        };
        let path = self.path(name);
        match convert(value) {
            Some(converted) => {
                report.accept(path);
                Some(converted)
            }
            None => {
                report.reject(
                    path,
                    format!("expected {}, got {}", expected, ValueKind::of(value)),
                );
                None
            }
        }
    }

    fn string(&self, name: &str, report: &mut ImportReport) -> Option<String> {
        self.take(name, "string", report, |v| v.as_str().map(str::to_string))
    }

    fn boolean(&self, name: &str, report: &mut ImportReport) -> Option<bool> {
        self.take(name, "boolean", report, Value::as_bool)
    }

    fn count(&self, name: &str, report: &mut ImportReport) -> Option<u64> {
        self.take(name, "non-negative integer", report, Value::as_u64)
    }

    fn any(&self, name: &str, report: &mut ImportReport) -> Option<Value> {
        self.take(name, "any value", report, |v| Some(v.clone()))
    }

    fn object(&self, name: &str, report: &mut ImportReport) -> Option<&'a Map<String, Value>> {
        let fields: &'a Map<String, Value> = self.fields;
        self.take(name, "object", report, |v| v.as_object().map(|_| ()))
            .and_then(|()| fields.get(name).and_then(Value::as_object))
    }
}

impl ImpulseRecord {
    /// Import a record from a raw JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error only if the root is not an object; field-level
    /// problems are listed in the report instead.
    pub fn from_value(raw: &Value) -> Result<(Self, ImportReport), RecordError> {
        let root = raw
            .as_object()
            .ok_or_else(|| RecordError::NotAnObject(ValueKind::of(raw)))?;

        let mut report = ImportReport::new();
        let mut record = Self::default();
        let top = Level {
            fields: root,
            prefix: "",
        };

        record.id = top.string("id", &mut report);
        if let Some(content) = top.any("content", &mut report) {
            record.content = content;
        }
        if let Some(history) = top.any("history", &mut report) {
            record.history = history;
        }
        if let Some(info) = top.object("info", &mut report) {
            record.info = InfoRecord::import(info, &mut report);
        }

        Ok((record, report))
    }

    /// Export to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<Value, RecordError> {
        Ok(serde_json::to_value(self)?)
    }
}

impl InfoRecord {
    fn import(fields: &Map<String, Value>, report: &mut ImportReport) -> Self {
        let level = Level {
            fields,
            prefix: "info",
        };
        let mut info = Self {
            emitter: level.string("emitter", report),
            ..Self::default()
        };
        if let Some(frequencies) = level.take("frequencies", "frequency list", report, |v| {
            serde_json::from_value::<FrequencyCollection>(v.clone()).ok()
        }) {
            info.frequencies = frequencies;
        }
        if let Some(encryption) = level.boolean("encryption", report) {
            info.encryption = encryption;
        }
        if let Some(reply) = level.object("reply", report) {
            info.reply = ReplyLink::import(reply, report);
        }
        if let Some(options) = level.object("options", report) {
            info.options = OptionsRecord::import(options, report);
        }
        info
    }
}

impl ReplyLink {
    fn import(fields: &Map<String, Value>, report: &mut ImportReport) -> Self {
        let level = Level {
            fields,
            prefix: "info.reply",
        };
        Self {
            impulse: level.string("impulse", report),
            emitter: level.string("emitter", report),
            stack: level.count("stack", report),
        }
    }
}

impl OptionsRecord {
    fn import(fields: &Map<String, Value>, report: &mut ImportReport) -> Self {
        let level = Level {
            fields,
            prefix: "info.options",
        };
        Self {
            trace: level.boolean("trace", report).unwrap_or(false),
            trace_content: level.string("traceContent", report),
            debug: level.boolean("debug", report).unwrap_or(false),
            debug_content: level.string("debugContent", report),
        }
    }
}

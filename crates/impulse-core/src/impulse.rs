//! Impulses: routed, traceable message envelopes with transactional emit.
//!
//! An impulse carries a content object plus routing metadata: the emitter
//! that sends it, the frequencies it goes out on, reply linkage and opt-in
//! trace/debug payloads. Every [`Impulse::emit`] is a small transaction:
//! provenance is recorded first, the impulse is sent to every frequency that
//! still resolves on the bus, and if none does, the provenance is taken back
//! so the failed attempt leaves no trace.

use crate::bus::Bus;
use crate::flow::{CommunicationFlow, EmitRecord, EmitterMark};
use crate::message::Message;
use crate::metrics;
use bytes::Bytes;
use impulse_protocol::{
    codec, hash, CodecError, Emitter, EmitterError, Frequency, FrequencyCollection, ImportReport,
    ImpulseRecord, InfoRecord, OptionsRecord, RecordError, ReplyLink, ValueKind,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Prefix of generated impulse ids.
pub const IMPULSE_ID_PREFIX: &str = "i.";

/// Errors from impulse mutators, import and export.
#[derive(Debug, Error)]
pub enum ImpulseError {
    /// Emitter identity has the wrong shape.
    #[error("Invalid emitter: {0}")]
    Emitter(#[from] EmitterError),

    /// No bus attached to resolve frequencies against.
    #[error("No bus attached")]
    NoBus,

    /// The bus has no live channel for the pair.
    #[error("No live channel for {entity}/{channel}")]
    UnknownChannel { entity: String, channel: String },

    /// Content must be an object.
    #[error("Content must be an object, got {0}")]
    InvalidContent(ValueKind),

    /// Trace and debug payloads must be objects.
    #[error("Trace/debug payload must be an object, got {0}")]
    InvalidPayload(ValueKind),

    /// A reply needs an impulse that has been emitted.
    #[error("Impulse has not been emitted yet")]
    NotEmitted,

    /// Record import/export failure.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Framing failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Why an emit did not happen.
///
/// Every variant leaves the emit stack and emitter index as they were.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("No bus attached")]
    NoBus,

    #[error("No frequency set")]
    NoFrequency,

    #[error("No emitter set")]
    NoEmitter,

    /// None of the frequencies accepted the impulse.
    #[error("No live destination accepted the impulse")]
    NoRoute,

    #[error("Failed to encode impulse: {0}")]
    Encode(String),
}

/// Opt-in introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceOptions {
    pub trace: bool,
    pub trace_content: Option<Value>,
    pub debug: bool,
    pub debug_content: Option<Value>,
}

/// Routing metadata of an impulse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpulseInfo {
    /// Emitter stamped by the last emit.
    pub emitter: Option<Emitter>,
    pub frequencies: FrequencyCollection,
    pub reply: ReplyLink,
    pub options: TraceOptions,
    pub encryption: bool,
}

/// A routed message envelope.
#[derive(Clone, Default)]
pub struct Impulse {
    id: Option<String>,
    info: ImpulseInfo,
    content: Map<String, Value>,
    history: Option<CommunicationFlow>,
    flow: CommunicationFlow,
    current_emitter: Option<Emitter>,
    bus: Option<Arc<dyn Bus>>,
}

impl fmt::Debug for Impulse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Impulse")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("content", &self.content)
            .field("emits", &self.flow.len())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

impl Impulse {
    /// Create an empty impulse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The impulse id, assigned on first successful emit or import.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Routing metadata.
    #[must_use]
    pub fn info(&self) -> &ImpulseInfo {
        &self.info
    }

    // Emitter

    /// Set the emitter for the next emits.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is malformed; the current emitter is
    /// kept in that case.
    pub fn set_emitter(&mut self, identity: &Value) -> Result<(), ImpulseError> {
        self.current_emitter = Some(Emitter::from_identity(identity)?);
        Ok(())
    }

    /// The emitter the next emit will stamp.
    #[must_use]
    pub fn emitter(&self) -> Option<&Emitter> {
        self.current_emitter.as_ref()
    }

    #[must_use]
    pub fn has_emitter(&self) -> bool {
        self.current_emitter.is_some()
    }

    /// Every emitter that successfully emitted this impulse, first-seen order.
    #[must_use]
    pub fn known_emitters(&self) -> &[Emitter] {
        self.flow.emitters()
    }

    // Bus and frequencies

    /// Attach the bus frequencies are resolved against.
    pub fn set_bus(&mut self, bus: Arc<dyn Bus>) {
        self.bus = Some(bus);
    }

    #[must_use]
    pub fn has_bus(&self) -> bool {
        self.bus.is_some()
    }

    /// Add a route.
    ///
    /// Only pairs the bus currently reports as live are accepted. Returns
    /// `Ok(false)` if the pair is already a frequency of this impulse.
    ///
    /// # Errors
    ///
    /// Returns an error if no bus is attached or the pair is not live.
    pub fn add_frequency(&mut self, entity: &str, channel: &str) -> Result<bool, ImpulseError> {
        let bus = self.bus.as_ref().ok_or(ImpulseError::NoBus)?;
        if !bus.exists(entity, channel) {
            return Err(ImpulseError::UnknownChannel {
                entity: entity.to_string(),
                channel: channel.to_string(),
            });
        }
        Ok(self.info.frequencies.add(Frequency::new(entity, channel)))
    }

    #[must_use]
    pub fn has_frequency(&self, entity: &str, channel: &str) -> bool {
        self.info.frequencies.contains(entity, channel)
    }

    #[must_use]
    pub fn is_frequency_set(&self) -> bool {
        !self.info.frequencies.is_empty()
    }

    #[must_use]
    pub fn frequencies(&self) -> &FrequencyCollection {
        &self.info.frequencies
    }

    // Trace and debug

    /// Turn tracing on with the given payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not an object.
    pub fn subscribe_trace(&mut self, payload: &Value) -> Result<(), ImpulseError> {
        let payload = require_object(payload).map_err(ImpulseError::InvalidPayload)?;
        self.info.options.trace = true;
        self.info.options.trace_content = Some(payload);
        Ok(())
    }

    /// Turn tracing off and drop its payload.
    pub fn cancel_trace(&mut self) {
        self.info.options.trace = false;
        self.info.options.trace_content = None;
    }

    #[must_use]
    pub fn is_traceable(&self) -> bool {
        self.info.options.trace
    }

    /// Turn debugging on with the given payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not an object.
    pub fn subscribe_debug(&mut self, payload: &Value) -> Result<(), ImpulseError> {
        let payload = require_object(payload).map_err(ImpulseError::InvalidPayload)?;
        self.info.options.debug = true;
        self.info.options.debug_content = Some(payload);
        Ok(())
    }

    /// Turn debugging off and drop its payload.
    pub fn cancel_debug(&mut self) {
        self.info.options.debug = false;
        self.info.options.debug_content = None;
    }

    #[must_use]
    pub fn is_debuggable(&self) -> bool {
        self.info.options.debug
    }

    // Content

    /// Replace the content.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not an object.
    pub fn set_content(&mut self, content: &Value) -> Result<(), ImpulseError> {
        let Value::Object(fields) = content else {
            return Err(ImpulseError::InvalidContent(ValueKind::of(content)));
        };
        self.content = fields.clone();
        Ok(())
    }

    /// Shallow-merge `content` into the current content.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` is not an object.
    pub fn add_content(&mut self, content: &Value) -> Result<(), ImpulseError> {
        let Value::Object(fields) = content else {
            return Err(ImpulseError::InvalidContent(ValueKind::of(content)));
        };
        for (key, value) in fields {
            self.content.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn clear_content(&mut self) {
        self.content.clear();
    }

    #[must_use]
    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    // Misc metadata

    pub fn set_encryption(&mut self, encryption: bool) {
        self.info.encryption = encryption;
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.info.encryption
    }

    /// Mark this impulse as a reply.
    pub fn set_reply(&mut self, reply: ReplyLink) {
        self.info.reply = reply;
    }

    #[must_use]
    pub fn reply(&self) -> &ReplyLink {
        &self.info.reply
    }

    /// Start a reply to this impulse's latest emit.
    ///
    /// The reply shares this impulse's bus and links back to its id, the
    /// emitter of its latest emit, and that emit's position in the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if this impulse has never been emitted.
    pub fn reply_to(&self) -> Result<Impulse, ImpulseError> {
        let id = self.id.clone().ok_or(ImpulseError::NotEmitted)?;
        let last = self.flow.last().ok_or(ImpulseError::NotEmitted)?;

        let mut reply = Impulse::new();
        reply.bus = self.bus.clone();
        reply.info.reply = ReplyLink {
            impulse: Some(id),
            emitter: last.info.emitter.as_ref().map(|e| e.id().to_string()),
            stack: Some((self.flow.len() - 1) as u64),
        };
        Ok(reply)
    }

    // History

    /// Number of successful emits.
    #[must_use]
    pub fn emit_count(&self) -> usize {
        self.flow.len()
    }

    /// The latest emit-stack entry.
    #[must_use]
    pub fn last_emit_info(&self) -> Option<&EmitRecord> {
        self.flow.last()
    }

    /// Communication flow attached to the impulse itself.
    ///
    /// Only populated by emits made with both trace and debug on.
    #[must_use]
    pub fn history(&self) -> Option<&CommunicationFlow> {
        self.history.as_ref()
    }

    /// The full local communication flow.
    #[must_use]
    pub fn flow(&self) -> &CommunicationFlow {
        &self.flow
    }

    // Dispatch

    /// Emit the impulse on all of its frequencies.
    ///
    /// Returns how many channels accepted it.
    ///
    /// # Errors
    ///
    /// Returns an error without touching any state if the bus, a frequency or
    /// the emitter is missing. Returns [`EmitError::NoRoute`] after rolling
    /// back if no frequency still resolves to a channel that accepts the
    /// impulse.
    pub fn emit(&mut self) -> Result<usize, EmitError> {
        let bus = self.bus.clone().ok_or(EmitError::NoBus)?;
        if !self.is_frequency_set() {
            return Err(EmitError::NoFrequency);
        }
        let emitter = self.current_emitter.clone().ok_or(EmitError::NoEmitter)?;

        let previous = self.info.emitter.replace(emitter.clone());
        let mark = self.flow.record_emitter(&emitter);
        if self.id.is_none() {
            self.id = Some(self.generate_id());
        }
        self.flow.push(EmitRecord::capture(&self.info));
        self.refresh_history();

        let payload = match self.export().and_then(|record| Ok(record.to_value()?)) {
            Ok(payload) => payload,
            Err(err) => {
                self.rollback(&emitter, mark, previous);
                return Err(EmitError::Encode(err.to_string()));
            }
        };

        let mut accepted = 0;
        for frequency in self.info.frequencies.iter_mut() {
            let (entity, channel) = (frequency.entity(), frequency.channel());
            let destination = match bus.get(entity, channel) {
                Some(destination) if bus.exists(entity, channel) => destination,
                _ => {
                    debug!(impulse = ?self.id, entity = %entity, channel = %channel, "Frequency does not resolve");
                    continue;
                }
            };
            match destination.send(Message::new(payload.clone())) {
                Ok(message_id) => {
                    frequency.set_impulse_id(message_id);
                    accepted += 1;
                }
                Err(err) => {
                    warn!(impulse = ?self.id, entity = %entity, channel = %channel, "Channel refused impulse: {}", err);
                }
            }
        }

        if accepted == 0 {
            self.rollback(&emitter, mark, previous);
            metrics::record_emit(false);
            debug!(impulse = ?self.id, "Emit rolled back: no live destination");
            return Err(EmitError::NoRoute);
        }

        let frequencies = self.info.frequencies.clone();
        if let Some(last) = self.flow.last_mut() {
            last.info.frequencies = frequencies;
        }
        self.refresh_history();
        metrics::record_emit(true);
        trace!(impulse = ?self.id, accepted, emits = self.flow.len(), "Impulse emitted");
        Ok(accepted)
    }

    fn rollback(&mut self, emitter: &Emitter, mark: EmitterMark, previous: Option<Emitter>) {
        self.flow.rollback(emitter, mark);
        self.info.emitter = previous;
        self.history = None;
    }

    fn refresh_history(&mut self) {
        self.history = (self.is_traceable() && self.is_debuggable()).then(|| self.flow.clone());
    }

    fn generate_id(&self) -> String {
        let state = serde_json::to_string(&(&self.info, &self.content)).unwrap_or_default();
        let salt = rand::random::<u64>().to_string();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default()
            .to_string();
        format!(
            "{}{}",
            IMPULSE_ID_PREFIX,
            hash::fingerprint(&[state.as_str(), salt.as_str(), nanos.as_str()])
        )
    }

    // Transport

    /// Export to transport form.
    ///
    /// # Errors
    ///
    /// Returns an error if the history or a trace/debug payload cannot be
    /// serialized.
    pub fn export(&self) -> Result<ImpulseRecord, ImpulseError> {
        let history = match &self.history {
            Some(flow) => serde_json::to_value(flow).map_err(RecordError::from)?,
            None => Value::Object(Map::new()),
        };
        let options = &self.info.options;

        Ok(ImpulseRecord {
            id: self.id.clone(),
            content: Value::Object(self.content.clone()),
            history,
            info: InfoRecord {
                emitter: self.info.emitter.as_ref().map(|e| e.id().to_string()),
                frequencies: self.info.frequencies.clone(),
                reply: self.info.reply.clone(),
                options: OptionsRecord {
                    trace: options.trace,
                    trace_content: payload_text(options.trace_content.as_ref())?,
                    debug: options.debug,
                    debug_content: payload_text(options.debug_content.as_ref())?,
                },
                encryption: self.info.encryption,
            },
        })
    }

    /// Import from a raw transport record.
    ///
    /// Fields of the wrong type are dropped and listed in the report; the
    /// rest of the record is still imported.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not an object.
    pub fn import(raw: &Value) -> Result<(Self, ImportReport), ImpulseError> {
        let (record, report) = ImpulseRecord::from_value(raw)?;
        Ok(Self::from_record(record, report))
    }

    /// Import from a message delivered by a channel.
    ///
    /// # Errors
    ///
    /// See [`Impulse::import`].
    pub fn from_message(message: &Message) -> Result<(Self, ImportReport), ImpulseError> {
        Self::import(&message.payload)
    }

    /// Encode to a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns an error if export or framing fails.
    pub fn encode(&self) -> Result<Bytes, ImpulseError> {
        Ok(codec::encode(&self.export()?)?)
    }

    /// Decode a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is incomplete or not a record.
    pub fn decode(data: &[u8]) -> Result<(Self, ImportReport), ImpulseError> {
        let (record, report) = codec::decode(data)?;
        Ok(Self::from_record(record, report))
    }

    fn from_record(record: ImpulseRecord, mut report: ImportReport) -> (Self, ImportReport) {
        let mut impulse = Self::new();
        impulse.id = record.id;

        match record.content {
            Value::Object(fields) => impulse.content = fields,
            other => report.overrule(
                "content",
                format!("expected object, got {}", ValueKind::of(&other)),
            ),
        }

        match record.history {
            Value::Object(fields) if fields.is_empty() => {}
            other => match serde_json::from_value::<CommunicationFlow>(other) {
                Ok(flow) => impulse.history = Some(flow),
                Err(err) => report.overrule("history", format!("not a communication flow: {err}")),
            },
        }

        let info = record.info;
        if let Some(id) = info.emitter {
            match Emitter::from_id(id) {
                Ok(emitter) => impulse.info.emitter = Some(emitter),
                Err(err) => report.overrule("info.emitter", err.to_string()),
            }
        }
        impulse.info.frequencies = info.frequencies;
        impulse.info.reply = info.reply;
        impulse.info.encryption = info.encryption;

        let options = info.options;
        impulse.info.options.trace = options.trace;
        impulse.info.options.debug = options.debug;
        impulse.info.options.trace_content = options
            .trace_content
            .and_then(|text| parse_payload(&text, "info.options.traceContent", &mut report));
        impulse.info.options.debug_content = options
            .debug_content
            .and_then(|text| parse_payload(&text, "info.options.debugContent", &mut report));

        if !report.is_clean() {
            debug!(
                impulse = ?impulse.id,
                rejected = report.rejected().count(),
                "Impulse imported with rejected fields"
            );
        }
        (impulse, report)
    }
}

fn require_object(value: &Value) -> Result<Value, ValueKind> {
    match value {
        Value::Object(_) => Ok(value.clone()),
        other => Err(ValueKind::of(other)),
    }
}

fn payload_text(payload: Option<&Value>) -> Result<Option<String>, ImpulseError> {
    payload
        .map(|value| {
            serde_json::to_string(value).map_err(|e| ImpulseError::from(RecordError::from(e)))
        })
        .transpose()
}

fn parse_payload(text: &str, path: &str, report: &mut ImportReport) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(other) => {
            report.overrule(
                path,
                format!("expected JSON object text, got {}", ValueKind::of(&other)),
            );
            None
        }
        Err(err) => {
            report.overrule(path, format!("expected JSON object text: {err}"));
            None
        }
    }
}

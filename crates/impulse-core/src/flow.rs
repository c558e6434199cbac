//! Communication flow: the provenance log an impulse keeps across emits.

use crate::impulse::ImpulseInfo;
use impulse_protocol::Emitter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Introspection payloads captured with an emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmitContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

/// One entry of the emit stack.
///
/// Carries a snapshot of the routing metadata at emit time. The impulse
/// content itself is never recorded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitRecord {
    /// Milliseconds since the Unix epoch.
    pub time: u64,
    pub info: ImpulseInfo,
    pub content: EmitContent,
}

impl EmitRecord {
    /// Snapshot `info` as of now.
    #[must_use]
    pub fn capture(info: &ImpulseInfo) -> Self {
        let options = &info.options;
        let content = EmitContent {
            trace: options
                .trace_content
                .clone()
                .filter(|_| options.trace),
            debug: options
                .debug_content
                .clone()
                .filter(|_| options.debug),
        };
        Self {
            time: now_millis(),
            info: info.clone(),
            content,
        }
    }

    /// Whether this emit was made by `emitter`.
    #[must_use]
    pub fn is_from(&self, emitter: &Emitter) -> bool {
        self.info
            .emitter
            .as_ref()
            .is_some_and(|own| own.is_equal(emitter))
    }
}

/// Emit stack plus the ordered set of emitters that ever sent the impulse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationFlow {
    emit_stack: Vec<EmitRecord>,
    emitters: Vec<Emitter>,
}

/// Emitter index size before an emit, for rollback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EmitterMark(usize);

impl CommunicationFlow {
    /// Create an empty flow.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit stack, oldest first.
    #[must_use]
    pub fn emit_stack(&self) -> &[EmitRecord] {
        &self.emit_stack
    }

    /// Known emitters in first-seen order.
    #[must_use]
    pub fn emitters(&self) -> &[Emitter] {
        &self.emitters
    }

    /// Most recent emit.
    #[must_use]
    pub fn last(&self) -> Option<&EmitRecord> {
        self.emit_stack.last()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut EmitRecord> {
        self.emit_stack.last_mut()
    }

    /// Number of recorded emits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.emit_stack.len()
    }

    /// Check if nothing was emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emit_stack.is_empty()
    }

    /// Whether `emitter` is in the index.
    #[must_use]
    pub fn knows(&self, emitter: &Emitter) -> bool {
        self.emitters.iter().any(|known| known.is_equal(emitter))
    }

    /// Add `emitter` to the index unless already known.
    pub(crate) fn record_emitter(&mut self, emitter: &Emitter) -> EmitterMark {
        let mark = EmitterMark(self.emitters.len());
        if !self.knows(emitter) {
            self.emitters.push(emitter.clone());
        }
        mark
    }

    pub(crate) fn push(&mut self, record: EmitRecord) {
        self.emit_stack.push(record);
    }

    /// Undo the last `push` and, when it added one, the emitter addition.
    ///
    /// The emitter is only dropped if it is the newest entry of the index,
    /// the index grew since `mark`, and no remaining emit references it.
    pub(crate) fn rollback(&mut self, emitter: &Emitter, mark: EmitterMark) {
        self.emit_stack.pop();

        let newest = self
            .emitters
            .last()
            .is_some_and(|last| last.is_equal(emitter));
        let grew = self.emitters.len() > mark.0;
        let referenced = self.emit_stack.iter().any(|emit| emit.is_from(emitter));
        if newest && grew && !referenced {
            self.emitters.pop();
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

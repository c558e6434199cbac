//! Messages carried by channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provenance entry left by every channel that processes a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEntry {
    pub entity: String,
    pub channel: String,
}

/// A message queued on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Queue id, assigned by the channel on send.
    pub id: String,
    /// Message payload.
    pub payload: Value,
    /// Channels this message went through, oldest first.
    pub reply_stack: Vec<ReplyEntry>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            id: String::new(),
            payload: payload.into(),
            reply_stack: Vec::new(),
        }
    }

    /// Append a provenance entry.
    pub fn stamp(&mut self, entity: &str, channel: &str) {
        self.reply_stack.push(ReplyEntry {
            entity: entity.to_string(),
            channel: channel.to_string(),
        });
    }

    /// The channel that processed this message most recently.
    #[must_use]
    pub fn last_hop(&self) -> Option<&ReplyEntry> {
        self.reply_stack.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(json!({"hello": "world"}));
        assert!(msg.id.is_empty());
        assert!(msg.reply_stack.is_empty());
        assert!(msg.last_hop().is_none());
    }

    #[test]
    fn test_message_stamp() {
        let mut msg = Message::new("ping");
        msg.stamp("app", "events");
        msg.stamp("app", "audit");

        assert_eq!(msg.reply_stack.len(), 2);
        assert_eq!(msg.last_hop().unwrap().channel, "audit");
    }
}

//! Listener registrations and the hooks they are promoted into.

use crate::message::Message;
use crate::queue::QueueId;
use impulse_protocol::hash;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error a listener returns to signal it could not handle a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    /// Create a listener error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Callback invoked with every delivered message.
pub type Listener = Arc<dyn Fn(&Message) -> Result<(), ListenerError> + Send + Sync>;

/// A listener registration.
///
/// Registrations are validated when added to a channel: both `id` and
/// `listener` must be present.
#[derive(Clone, Default)]
pub struct ListenerInfo {
    pub id: Option<String>,
    pub listener: Option<Listener>,
    /// Remaining deliveries; `None` means unlimited.
    pub times: Option<u32>,
}

impl ListenerInfo {
    /// Register an infallible callback.
    #[must_use]
    pub fn new<F>(id: impl Into<String>, listener: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self::fallible(id, move |message| {
            listener(message);
            Ok(())
        })
    }

    /// Register a callback that may report failure.
    #[must_use]
    pub fn fallible<F>(id: impl Into<String>, listener: F) -> Self
    where
        F: Fn(&Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Self {
            id: Some(id.into()),
            listener: Some(Arc::new(listener)),
            times: None,
        }
    }

    /// A registration with an id but no callback.
    #[must_use]
    pub fn without_listener(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Limit the number of deliveries.
    #[must_use]
    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    /// Check the registration is usable.
    ///
    /// # Errors
    ///
    /// Returns a static reason if a required field is missing.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_none() {
            return Err("Listener registration has no id");
        }
        if self.listener.is_none() {
            return Err("Listener registration has no callable listener");
        }
        Ok(())
    }
}

impl fmt::Debug for ListenerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerInfo")
            .field("id", &self.id)
            .field("listener", &self.listener.as_ref().map(|_| "<fn>"))
            .field("times", &self.times)
            .finish()
    }
}

/// A listener registration promoted into a channel's active set.
#[derive(Debug, Clone)]
pub struct Hook {
    /// Content hash of the registration.
    pub hook_id: String,
    /// Id the registration received in the listener queue.
    pub source_queue_id: QueueId,
    pub data: ListenerInfo,
}

impl Hook {
    /// Promote a drained registration.
    ///
    /// Returns `None` if the registration has no callable listener.
    #[must_use]
    pub fn promote(source_queue_id: QueueId, data: ListenerInfo) -> Option<Self> {
        data.listener.as_ref()?;
        let times = data.times.map(|t| t.to_string()).unwrap_or_default();
        let hook_id = hash::fingerprint(&[
            data.id.as_deref().unwrap_or_default(),
            &times,
            &source_queue_id,
        ]);
        Some(Self {
            hook_id,
            source_queue_id,
            data,
        })
    }

    /// Whether the delivery budget is spent.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.data.times == Some(0)
    }

    /// Consume one delivery from the budget, if there is one.
    pub fn consume(&mut self) {
        if let Some(times) = self.data.times.as_mut() {
            *times = times.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_validation() {
        assert!(ListenerInfo::new("a", |_| {}).validate().is_ok());
        assert!(ListenerInfo::without_listener("a").validate().is_err());
        assert!(ListenerInfo::default().validate().is_err());
    }

    #[test]
    fn test_hook_budget() {
        let info = ListenerInfo::new("a", |_| {}).times(2);
        let mut hook = Hook::promote("l.0".to_string(), info).unwrap();

        hook.consume();
        assert!(!hook.is_exhausted());
        hook.consume();
        assert!(hook.is_exhausted());
        hook.consume();
        assert_eq!(hook.data.times, Some(0));
    }

    #[test]
    fn test_unlimited_hook_never_exhausts() {
        let mut hook = Hook::promote("l.0".to_string(), ListenerInfo::new("a", |_| {})).unwrap();
        hook.consume();
        assert!(!hook.is_exhausted());
    }

    #[test]
    fn test_identical_registrations_get_distinct_hook_ids() {
        let a = Hook::promote("l.0".to_string(), ListenerInfo::new("same", |_| {})).unwrap();
        let b = Hook::promote("l.1".to_string(), ListenerInfo::new("same", |_| {})).unwrap();
        assert_ne!(a.hook_id, b.hook_id);
    }

    #[test]
    fn test_promote_requires_listener() {
        assert!(Hook::promote("l.0".to_string(), ListenerInfo::without_listener("a")).is_none());
    }
}

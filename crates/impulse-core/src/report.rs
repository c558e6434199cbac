//! Delivery fault reporting.
//!
//! A listener that fails, panics or overruns its time budget never stops a
//! channel. The fault is handed to the channel's [`FaultReporter`] instead.

use crate::metrics;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// What went wrong while invoking a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The listener returned an error.
    Failed(String),
    /// The listener panicked.
    Panicked(String),
    /// The listener did not return within the configured limit.
    TimedOut(Duration),
    /// The listener task was cancelled before completing.
    Cancelled,
}

impl FaultKind {
    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "listener failed: {reason}"),
            Self::Panicked(reason) => write!(f, "listener panicked: {reason}"),
            Self::TimedOut(limit) => write!(f, "listener exceeded {limit:?}"),
            Self::Cancelled => f.write_str("listener task cancelled"),
        }
    }
}

/// A fault raised while delivering one message to one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFault {
    pub entity: String,
    pub channel: String,
    pub message_id: String,
    pub hook_id: String,
    /// Id of the listener registration, if it had one.
    pub listener_id: Option<String>,
    pub kind: FaultKind,
    /// Hooks that were skipped for this message because of the fault.
    pub skipped: usize,
}

impl fmt::Display for DeliveryFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: message {} aborted at hook {} ({})",
            self.entity, self.channel, self.message_id, self.hook_id, self.kind
        )
    }
}

/// Receives delivery faults from channels.
pub trait FaultReporter: Send + Sync {
    /// Report a fault.
    fn report(&self, fault: &DeliveryFault);
}

/// Logs faults through `tracing` and counts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FaultReporter for TracingReporter {
    fn report(&self, fault: &DeliveryFault) {
        warn!(
            entity = %fault.entity,
            channel = %fault.channel,
            message = %fault.message_id,
            hook = %fault.hook_id,
            skipped = fault.skipped,
            "Delivery fault: {}",
            fault.kind
        );
        metrics::record_listener_fault(fault.kind.label());
    }
}

/// Keeps every reported fault in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    faults: Mutex<Vec<DeliveryFault>>,
}

impl MemoryReporter {
    /// Create an empty reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults reported so far.
    #[must_use]
    pub fn faults(&self) -> Vec<DeliveryFault> {
        self.faults.lock().clone()
    }

    /// Number of faults reported so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    /// Check if no fault has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }
}

impl FaultReporter for MemoryReporter {
    fn report(&self, fault: &DeliveryFault) {
        self.faults.lock().push(fault.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(kind: FaultKind) -> DeliveryFault {
        DeliveryFault {
            entity: "app".to_string(),
            channel: "events".to_string(),
            message_id: "m.0".to_string(),
            hook_id: "h".to_string(),
            listener_id: Some("l1".to_string()),
            kind,
            skipped: 1,
        }
    }

    #[test]
    fn test_memory_reporter_collects() {
        let reporter = MemoryReporter::new();
        assert!(reporter.is_empty());

        reporter.report(&fault(FaultKind::Failed("boom".to_string())));
        reporter.report(&fault(FaultKind::Cancelled));

        assert_eq!(reporter.len(), 2);
        assert_eq!(reporter.faults()[1].kind, FaultKind::Cancelled);
    }

    #[test]
    fn test_fault_display() {
        let text = fault(FaultKind::TimedOut(Duration::from_millis(5))).to_string();
        assert!(text.starts_with("app/events: message m.0 aborted"));
        assert_eq!(FaultKind::Panicked("x".to_string()).label(), "panicked");
    }

    #[test]
    fn test_tracing_reporter_does_not_panic() {
        TracingReporter.report(&fault(FaultKind::Failed("boom".to_string())));
    }
}

//! Metrics instrumentation for the bus.
//!
//! Uses the `metrics` facade; nothing is recorded unless the embedding
//! application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const MESSAGES_SENT: &str = "impulse_messages_sent_total";
    pub const MESSAGES_DELIVERED: &str = "impulse_messages_delivered_total";
    pub const MESSAGES_DROPPED: &str = "impulse_messages_dropped_total";
    pub const LISTENER_FAULTS: &str = "impulse_listener_faults_total";
    pub const EMITS: &str = "impulse_emits_total";
    pub const EMIT_ROLLBACKS: &str = "impulse_emit_rollbacks_total";
    pub const CHANNELS_ACTIVE: &str = "impulse_channels_active";
}

/// Describe all metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::MESSAGES_SENT, "Messages accepted by channels");
    metrics::describe_counter!(
        names::MESSAGES_DELIVERED,
        "Messages that went through a delivery sub-phase"
    );
    metrics::describe_counter!(
        names::MESSAGES_DROPPED,
        "Messages evicted or rejected by a full channel queue"
    );
    metrics::describe_counter!(names::LISTENER_FAULTS, "Listener invocations that faulted");
    metrics::describe_counter!(names::EMITS, "Successful impulse emits");
    metrics::describe_counter!(
        names::EMIT_ROLLBACKS,
        "Impulse emits rolled back for lack of a live destination"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels held by the registry");
}

/// Record a message accepted by a channel.
pub fn record_sent(entity: &str, channel: &str) {
    counter!(
        names::MESSAGES_SENT,
        "entity" => entity.to_string(),
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a delivered message.
pub fn record_delivered(entity: &str, channel: &str) {
    counter!(
        names::MESSAGES_DELIVERED,
        "entity" => entity.to_string(),
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a message lost to backpressure.
pub fn record_dropped(reason: &'static str) {
    counter!(names::MESSAGES_DROPPED, "reason" => reason).increment(1);
}

/// Record a listener fault.
pub fn record_listener_fault(kind: &'static str) {
    counter!(names::LISTENER_FAULTS, "kind" => kind).increment(1);
}

/// Record an emit outcome.
pub fn record_emit(accepted: bool) {
    if accepted {
        counter!(names::EMITS).increment(1);
    } else {
        counter!(names::EMIT_ROLLBACKS).increment(1);
    }
}

/// Update the registry channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

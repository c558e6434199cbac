//! Channel abstraction for Impulse.
//!
//! A channel is a named endpoint bound to an entity. Listeners register on it,
//! producers send messages to it, and the channel's own cycle task moves both
//! along: each cycle first promotes pending registrations into hooks, then
//! drains pending messages and invokes every hook with each of them.
//!
//! All queue and hook mutation happens under the channel's state lock, and
//! only the cycle task promotes or delivers, so the two sub-phases never
//! overlap. The lock is never held while a listener runs, which lets
//! listeners send to, register on, or remove from the channel that is
//! calling them.

use crate::config::{ChannelConfig, ConfigError, OverflowPolicy};
use crate::listener::{Hook, Listener, ListenerInfo};
use crate::message::Message;
use crate::metrics;
use crate::queue::{Queue, QueueId};
use crate::report::{DeliveryFault, FaultKind, FaultReporter, TracingReporter};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Maximum entity or channel name length.
pub const MAX_NAME_LENGTH: usize = 256;

/// Validate an entity or channel name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Name contains invalid characters");
    }
    Ok(())
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Invalid entity or channel name.
    #[error("Invalid name: {0}")]
    InvalidName(&'static str),

    /// Listener registration is missing a required field.
    #[error("Invalid listener: {0}")]
    InvalidListener(&'static str),

    /// The message queue is full and the policy is to reject.
    #[error("Channel {entity}/{channel} is full ({capacity} pending messages)")]
    QueueFull {
        entity: String,
        channel: String,
        capacity: usize,
    },

    /// Invalid channel configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No Tokio runtime to run the channel cycle on.
    #[error("Channels must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Composite channel status. Closed takes priority over on hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Closed,
    Open,
    OnHold,
}

/// Options for creating a channel.
#[derive(Clone)]
pub struct ChannelOptions {
    pub config: ChannelConfig,
    /// Where delivery faults go.
    pub reporter: Arc<dyn FaultReporter>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            config: ChannelConfig::default(),
            reporter: Arc::new(TracingReporter),
        }
    }
}

impl ChannelOptions {
    /// Options with a specific configuration.
    #[must_use]
    pub fn with_config(config: ChannelConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Replace the fault reporter.
    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn FaultReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

/// Result of [`Channel::send_and_listen`].
#[derive(Debug)]
pub struct SendAndListen {
    /// Queue id of the listener registration.
    pub listener: Result<QueueId, ChannelError>,
    /// Queue id of the message.
    pub message: Result<QueueId, ChannelError>,
}

struct ChannelState {
    open: bool,
    held: bool,
    draining: bool,
    listeners: Queue<ListenerInfo>,
    messages: Queue<Message>,
    hooks: Vec<Hook>,
}

impl ChannelState {
    fn status(&self) -> ChannelStatus {
        if !self.open {
            ChannelStatus::Closed
        } else if self.held {
            ChannelStatus::OnHold
        } else {
            ChannelStatus::Open
        }
    }

    fn is_active(&self) -> bool {
        self.status() == ChannelStatus::Open
    }

    fn has_work(&self) -> bool {
        !self.listeners.is_empty() || !self.messages.is_empty()
    }

    fn is_settled(&self) -> bool {
        !self.draining && (!self.is_active() || !self.has_work())
    }
}

/// What a delivery needs from a hook, captured outside the lock.
struct HookTarget {
    hook_id: String,
    source_queue_id: QueueId,
    listener_id: Option<String>,
    listener: Listener,
}

impl HookTarget {
    fn capture(hook: &Hook) -> Option<Self> {
        Some(Self {
            hook_id: hook.hook_id.clone(),
            source_queue_id: hook.source_queue_id.clone(),
            listener_id: hook.data.id.clone(),
            listener: Arc::clone(hook.data.listener.as_ref()?),
        })
    }
}

struct Shared {
    entity: String,
    name: String,
    config: ChannelConfig,
    reporter: Arc<dyn FaultReporter>,
    state: Mutex<ChannelState>,
    wake: Arc<Notify>,
    settled: Notify,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Lets the cycle task observe that the channel is gone.
        self.wake.notify_one();
    }
}

/// A channel for pub/sub messaging.
///
/// `Channel` is a cheap handle; clones share the same queues, hooks and
/// cycle task. The cycle task ends once every handle is dropped.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("entity", &self.shared.entity)
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Channel {
    /// Create a new open channel with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or no Tokio runtime is running.
    pub fn new(entity: impl Into<String>, name: impl Into<String>) -> Result<Self, ChannelError> {
        Self::with_options(entity, name, ChannelOptions::default())
    }

    /// Create a new channel with specific options.
    ///
    /// The channel starts its cycle immediately unless
    /// `config.start_on_hold` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if a name or the configuration is invalid, or no
    /// Tokio runtime is running.
    pub fn with_options(
        entity: impl Into<String>,
        name: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        let entity = entity.into();
        let name = name.into();
        validate_name(&entity).map_err(ChannelError::InvalidName)?;
        validate_name(&name).map_err(ChannelError::InvalidName)?;
        options.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let held = options.config.start_on_hold;
        let wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            entity,
            name,
            config: options.config,
            reporter: options.reporter,
            state: Mutex::new(ChannelState {
                open: true,
                held,
                draining: false,
                listeners: Queue::new("l"),
                messages: Queue::new("m"),
                hooks: Vec::new(),
            }),
            wake: Arc::clone(&wake),
            settled: Notify::new(),
        });

        runtime.spawn(run_cycles(Arc::downgrade(&shared), wake));
        debug!(entity = %shared.entity, channel = %shared.name, on_hold = held, "Channel created");

        Ok(Self { shared })
    }

    /// Get the entity name.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.shared.entity
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Get the channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Get the composite status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.shared.state.lock().status()
    }

    /// Whether a promotion or delivery sub-phase is running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.shared.state.lock().draining
    }

    /// Open the channel and restart its cycle.
    ///
    /// Returns `false` if the channel is already open.
    pub fn open(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.is_active() {
            return false;
        }
        state.open = true;
        state.held = false;
        drop(state);

        self.shared.wake.notify_one();
        debug!(entity = %self.entity(), channel = %self.name(), "Channel opened");
        true
    }

    /// Close the channel.
    ///
    /// Pending messages stay queued until the channel is opened again.
    /// Returns `false` if the channel is already closed.
    pub fn close(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        drop(state);

        self.shared.settled.notify_waiters();
        debug!(entity = %self.entity(), channel = %self.name(), "Channel closed");
        true
    }

    /// Put an open channel on hold.
    ///
    /// Returns `false` unless the channel is open.
    pub fn hold(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.status() != ChannelStatus::Open {
            return false;
        }
        state.held = true;
        drop(state);

        self.shared.settled.notify_waiters();
        debug!(entity = %self.entity(), channel = %self.name(), "Channel on hold");
        true
    }

    /// Resume a channel on hold.
    ///
    /// Returns `false` unless the channel is on hold.
    pub fn resume(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.status() != ChannelStatus::OnHold {
            return false;
        }
        state.held = false;
        drop(state);

        self.shared.wake.notify_one();
        debug!(entity = %self.entity(), channel = %self.name(), "Channel resumed");
        true
    }

    /// Register a listener.
    ///
    /// The registration becomes an active hook on the next cycle. Returns the
    /// id it was queued under.
    ///
    /// # Errors
    ///
    /// Returns an error, without queueing anything, if the registration has
    /// no id or no listener.
    pub fn add_listener(&self, info: ListenerInfo) -> Result<QueueId, ChannelError> {
        info.validate().map_err(ChannelError::InvalidListener)?;
        let listener_id = info.id.clone();
        let id = self.shared.state.lock().listeners.insert(info);
        self.shared.wake.notify_one();

        debug!(
            entity = %self.entity(),
            channel = %self.name(),
            queue_id = %id,
            listener = ?listener_id,
            "Listener registered"
        );
        Ok(id)
    }

    /// Remove a listener by the queue id it was registered under.
    ///
    /// Cancels the registration if it is still pending and drops the hook it
    /// was promoted into. A hook already captured by a running delivery still
    /// receives that message. Returns `true` if anything was removed.
    pub fn remove_listener(&self, id: &str) -> bool {
        let mut state = self.shared.state.lock();
        let cancelled = state.listeners.cancel(id);
        let before = state.hooks.len();
        state.hooks.retain(|hook| hook.source_queue_id != id);
        let removed = cancelled || state.hooks.len() < before;
        drop(state);

        if removed {
            debug!(entity = %self.entity(), channel = %self.name(), queue_id = %id, "Listener removed");
        }
        removed
    }

    /// Look up a listener registration by queue id.
    ///
    /// Finds pending registrations first, then promoted hooks.
    #[must_use]
    pub fn listener_info(&self, id: &str) -> Option<ListenerInfo> {
        let state = self.shared.state.lock();
        state
            .listeners
            .peek(id)
            .map(|record| record.data.clone())
            .or_else(|| {
                state
                    .hooks
                    .iter()
                    .find(|hook| hook.source_queue_id == id)
                    .map(|hook| hook.data.clone())
            })
    }

    /// Queue a message for delivery on a later cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::QueueFull`] if the queue is at capacity and the
    /// overflow policy is [`OverflowPolicy::Reject`].
    pub fn send(&self, message: Message) -> Result<QueueId, ChannelError> {
        let capacity = self.shared.config.max_pending_messages;
        let mut state = self.shared.state.lock();

        if state.messages.len() >= capacity {
            match self.shared.config.overflow {
                OverflowPolicy::Reject => {
                    drop(state);
                    metrics::record_dropped("rejected");
                    warn!(
                        entity = %self.entity(),
                        channel = %self.name(),
                        capacity,
                        "Message rejected: queue full"
                    );
                    return Err(ChannelError::QueueFull {
                        entity: self.entity().to_string(),
                        channel: self.name().to_string(),
                        capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = state.messages.pop_head() {
                        metrics::record_dropped("evicted");
                        warn!(
                            entity = %self.entity(),
                            channel = %self.name(),
                            evicted = %evicted.id,
                            "Queue full, oldest message evicted"
                        );
                    }
                }
            }
        }

        let id = state.messages.insert_with(|id| Message {
            id: id.to_string(),
            ..message
        });
        drop(state);

        self.shared.wake.notify_one();
        metrics::record_sent(self.entity(), self.name());
        trace!(entity = %self.entity(), channel = %self.name(), message = %id, "Message queued");
        Ok(id)
    }

    /// Register a listener, then send a message.
    ///
    /// The message is sent even if the registration is rejected.
    pub fn send_and_listen(&self, message: Message, info: ListenerInfo) -> SendAndListen {
        let listener = self.add_listener(info);
        let message = self.send(message);
        SendAndListen { listener, message }
    }

    /// Look up a pending message.
    ///
    /// Delivered messages leave the queue, so this returns `None` for them.
    #[must_use]
    pub fn message_info(&self, id: &str) -> Option<Message> {
        self.shared
            .state
            .lock()
            .messages
            .peek(id)
            .map(|record| record.data.clone())
    }

    /// Number of active hooks.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.shared.state.lock().hooks.len()
    }

    /// Hook ids in delivery order.
    #[must_use]
    pub fn hook_ids(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .hooks
            .iter()
            .map(|hook| hook.hook_id.clone())
            .collect()
    }

    /// Number of messages waiting for delivery.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    /// Number of registrations waiting for promotion.
    #[must_use]
    pub fn pending_listeners(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    /// Wait until the channel has nothing left to do.
    ///
    /// Resolves once no cycle is running and either both queues are empty or
    /// the channel is closed or on hold.
    pub async fn settled(&self) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.state.lock().is_settled() {
                return;
            }
            notified.await;
        }
    }
}

/// Drives one channel: runs a cycle while there is work, parks otherwise.
async fn run_cycles(channel: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        let Some(shared) = channel.upgrade() else {
            break;
        };
        let ran = shared.run_cycle().await;
        drop(shared);

        if ran {
            tokio::task::yield_now().await;
        } else {
            wake.notified().await;
        }
    }
    trace!("Channel cycle task finished");
}

impl Shared {
    /// Run one promotion + delivery cycle if the channel is open and has
    /// work. Returns whether a cycle ran.
    async fn run_cycle(&self) -> bool {
        let ready = {
            let state = self.state.lock();
            state.is_active() && state.has_work()
        };
        if !ready {
            self.settled.notify_waiters();
            return false;
        }

        self.promote_listeners();
        self.deliver_messages().await;
        self.settled.notify_waiters();
        true
    }

    fn promote_listeners(&self) {
        let mut state = self.state.lock();
        if state.listeners.is_empty() {
            return;
        }
        state.draining = true;

        while let Some(record) = state.listeners.pop_head() {
            if let Some(hook) = Hook::promote(record.id, record.data) {
                trace!(
                    entity = %self.entity,
                    channel = %self.name,
                    hook = %hook.hook_id,
                    queue_id = %hook.source_queue_id,
                    "Listener promoted"
                );
                state.hooks.push(hook);
            }
        }

        state.draining = false;
    }

    /// Deliver the messages that were pending when the sub-phase started.
    ///
    /// Messages sent while it runs, including those sent by listeners, stay
    /// queued for the next cycle, which the cycle task starts right away.
    async fn deliver_messages(&self) {
        let batch = {
            let mut state = self.state.lock();
            let pending = state.messages.len();
            if pending == 0 {
                return;
            }
            state.draining = true;

            let mut batch = Vec::with_capacity(pending);
            for _ in 0..pending {
                if let Some(record) = state.messages.pop_head() {
                    batch.push(record.data);
                }
            }
            batch
        };

        for mut message in batch {
            message.stamp(&self.entity, &self.name);
            let message = Arc::new(message);

            let snapshot: Vec<HookTarget> = self
                .state
                .lock()
                .hooks
                .iter()
                .filter_map(HookTarget::capture)
                .collect();

            let invoked = self.dispatch(&message, &snapshot).await;
            self.settle_budgets(&snapshot[..invoked]);

            metrics::record_delivered(&self.entity, &self.name);
            trace!(
                entity = %self.entity,
                channel = %self.name,
                message = %message.id,
                hooks = invoked,
                "Message delivered"
            );
        }

        self.state.lock().draining = false;
    }

    /// Invoke hooks in order, stopping at the first fault.
    ///
    /// Returns how many hooks completed. A faulting hook does not count, so
    /// it keeps its budget.
    async fn dispatch(&self, message: &Arc<Message>, snapshot: &[HookTarget]) -> usize {
        for (index, target) in snapshot.iter().enumerate() {
            if let Err(kind) = self.invoke(target, message).await {
                let fault = DeliveryFault {
                    entity: self.entity.clone(),
                    channel: self.name.clone(),
                    message_id: message.id.clone(),
                    hook_id: target.hook_id.clone(),
                    listener_id: target.listener_id.clone(),
                    kind,
                    skipped: snapshot.len() - index - 1,
                };
                self.reporter.report(&fault);
                return index;
            }
        }
        snapshot.len()
    }

    async fn invoke(&self, target: &HookTarget, message: &Arc<Message>) -> Result<(), FaultKind> {
        let listener = Arc::clone(&target.listener);
        let message = Arc::clone(message);
        let task = tokio::task::spawn_blocking(move || listener(&message));

        let joined = match self.config.listener_timeout() {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => return Err(FaultKind::TimedOut(limit)),
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FaultKind::Failed(err.to_string())),
            Err(err) if err.is_panic() => Err(FaultKind::Panicked(panic_message(err.into_panic()))),
            Err(_) => Err(FaultKind::Cancelled),
        }
    }

    /// Spend one delivery from each completed hook and drop exhausted hooks.
    fn settle_budgets(&self, invoked: &[HookTarget]) {
        let mut state = self.state.lock();
        for target in invoked {
            if let Some(hook) = state
                .hooks
                .iter_mut()
                .find(|hook| hook.source_queue_id == target.source_queue_id)
            {
                hook.consume();
            }
        }

        let before = state.hooks.len();
        state.hooks.retain(|hook| !hook.is_exhausted());
        let expired = before - state.hooks.len();
        if expired > 0 {
            debug!(entity = %self.entity, channel = %self.name, expired, "Hooks expired");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerError;
    use crate::report::MemoryReporter;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// A listener that forwards every message it sees.
    fn forwarding(id: &str) -> (ListenerInfo, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = ListenerInfo::new(id, move |message| {
            let _ = tx.send(message.clone());
        });
        (info, rx)
    }

    async fn settle(channel: &Channel) {
        tokio::time::timeout(WAIT, channel.settled())
            .await
            .expect("channel did not settle");
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("app:events").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(validate_name(&long_name).is_err());
    }

    #[test]
    fn test_channel_requires_runtime() {
        assert!(matches!(
            Channel::new("app", "events"),
            Err(ChannelError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_channel_creation() {
        let channel = Channel::new("app", "events").unwrap();
        assert_eq!(channel.entity(), "app");
        assert_eq!(channel.name(), "events");
        assert_eq!(channel.status(), ChannelStatus::Open);
        assert_eq!(channel.hook_count(), 0);

        assert!(matches!(
            Channel::new("", "events"),
            Err(ChannelError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let channel = Channel::new("app", "events").unwrap();

        assert!(!channel.open());
        assert!(!channel.resume());

        assert!(channel.hold());
        assert_eq!(channel.status(), ChannelStatus::OnHold);
        assert!(!channel.hold());

        assert!(channel.close());
        assert_eq!(channel.status(), ChannelStatus::Closed);
        assert!(!channel.close());
        assert!(!channel.hold());
        assert!(!channel.resume());

        assert!(channel.open());
        assert_eq!(channel.status(), ChannelStatus::Open);

        assert!(channel.hold());
        assert!(channel.resume());
        assert_eq!(channel.status(), ChannelStatus::Open);
    }

    #[tokio::test]
    async fn test_fifo_delivery_with_budget() {
        let channel = Channel::new("app", "events").unwrap();
        let (first, mut first_rx) = forwarding("l1");
        let (second, mut second_rx) = forwarding("l2");

        let first_id = channel.add_listener(first.times(1)).unwrap();
        let second_id = channel.add_listener(second).unwrap();
        channel.send(Message::new(json!({"n": 1}))).unwrap();
        settle(&channel).await;

        let seen = first_rx.try_recv().unwrap();
        assert_eq!(seen.payload, json!({"n": 1}));
        assert_eq!(seen.reply_stack.len(), 1);
        assert_eq!(seen.reply_stack[0].entity, "app");
        assert_eq!(seen.reply_stack[0].channel, "events");
        assert_eq!(second_rx.try_recv().unwrap().reply_stack.len(), 1);
        assert!(first_rx.try_recv().is_err());

        assert_eq!(channel.hook_count(), 1);
        assert!(channel.listener_info(&first_id).is_none());
        assert!(channel.listener_info(&second_id).is_some());

        channel.send(Message::new(json!({"n": 2}))).unwrap();
        settle(&channel).await;

        assert_eq!(second_rx.try_recv().unwrap().payload, json!({"n": 2}));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_budget_stops_within_one_cycle() {
        let channel = Channel::with_options(
            "app",
            "events",
            ChannelOptions::with_config(ChannelConfig {
                start_on_hold: true,
                ..ChannelConfig::default()
            }),
        )
        .unwrap();
        let (listener, mut rx) = forwarding("once");
        channel.add_listener(listener.times(1)).unwrap();
        channel.send(Message::new("a")).unwrap();
        channel.send(Message::new("b")).unwrap();

        assert!(channel.resume());
        settle(&channel).await;

        assert_eq!(rx.try_recv().unwrap().payload, json!("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_listener_is_rejected() {
        let channel = Channel::new("app", "events").unwrap();

        assert!(matches!(
            channel.add_listener(ListenerInfo::without_listener("x")),
            Err(ChannelError::InvalidListener(_))
        ));
        assert_eq!(channel.pending_listeners(), 0);
        assert!(channel.listener_info("x").is_none());
    }

    #[tokio::test]
    async fn test_on_hold_defers_delivery() {
        let channel = Channel::new("app", "events").unwrap();
        let (listener, mut rx) = forwarding("l1");
        channel.add_listener(listener).unwrap();
        settle(&channel).await;

        assert!(channel.hold());
        let id = channel.send(Message::new("held")).unwrap();
        settle(&channel).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.message_info(&id).unwrap().payload, json!("held"));

        assert!(channel.resume());
        let seen = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(seen.id, id);
        assert!(channel.message_info(&id).is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_keeps_messages() {
        let channel = Channel::new("app", "events").unwrap();
        let (listener, mut rx) = forwarding("l1");
        channel.add_listener(listener).unwrap();
        settle(&channel).await;

        assert!(channel.close());
        channel.send(Message::new(1)).unwrap();
        channel.send(Message::new(2)).unwrap();
        settle(&channel).await;
        assert_eq!(channel.pending_messages(), 2);

        assert!(channel.open());
        settle(&channel).await;
        assert_eq!(rx.try_recv().unwrap().payload, json!(1));
        assert_eq!(rx.try_recv().unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn test_remove_pending_and_promoted_listeners() {
        let channel = Channel::new("app", "events").unwrap();
        channel.hold();

        let (pending, _pending_rx) = forwarding("pending");
        let pending_id = channel.add_listener(pending).unwrap();
        assert!(channel.listener_info(&pending_id).is_some());
        assert!(channel.remove_listener(&pending_id));
        assert!(channel.listener_info(&pending_id).is_none());

        channel.resume();
        let (promoted, mut promoted_rx) = forwarding("promoted");
        let promoted_id = channel.add_listener(promoted).unwrap();
        settle(&channel).await;
        assert_eq!(channel.hook_count(), 1);

        assert!(channel.remove_listener(&promoted_id));
        assert!(!channel.remove_listener(&promoted_id));
        assert_eq!(channel.hook_count(), 0);

        channel.send(Message::new("late")).unwrap();
        settle(&channel).await;
        assert!(promoted_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removal_during_delivery_keeps_snapshot() {
        let channel = Channel::new("app", "events").unwrap();
        let victim_id: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

        let remover = {
            let channel = channel.clone();
            let victim_id = Arc::clone(&victim_id);
            ListenerInfo::new("remover", move |_| {
                if let Some(id) = victim_id.get() {
                    channel.remove_listener(id);
                }
            })
        };
        channel.add_listener(remover).unwrap();
        let (victim, mut victim_rx) = forwarding("victim");
        let _ = victim_id.set(channel.add_listener(victim).unwrap());
        settle(&channel).await;

        channel.send(Message::new("first")).unwrap();
        settle(&channel).await;
        assert_eq!(victim_rx.try_recv().unwrap().payload, json!("first"));
        assert_eq!(channel.hook_count(), 1);

        channel.send(Message::new("second")).unwrap();
        settle(&channel).await;
        assert!(victim_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_faulting_listener_is_reported_and_isolated() {
        let reporter = Arc::new(MemoryReporter::new());
        let channel = Channel::with_options(
            "app",
            "events",
            ChannelOptions::default().reporter(reporter.clone()),
        )
        .unwrap();

        let failing = ListenerInfo::fallible("failing", |message| {
            if message.payload == json!("bad") {
                Err(ListenerError::new("cannot handle"))
            } else {
                Ok(())
            }
        });
        channel.add_listener(failing).unwrap();
        let (after, mut after_rx) = forwarding("after");
        channel.add_listener(after).unwrap();

        channel.send(Message::new("bad")).unwrap();
        channel.send(Message::new("good")).unwrap();
        settle(&channel).await;

        assert_eq!(after_rx.try_recv().unwrap().payload, json!("good"));
        assert!(after_rx.try_recv().is_err());

        let faults = reporter.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Failed("cannot handle".to_string()));
        assert_eq!(faults[0].listener_id.as_deref(), Some("failing"));
        assert_eq!(faults[0].skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_budget() {
        let reporter = Arc::new(MemoryReporter::new());
        let channel = Channel::with_options(
            "app",
            "events",
            ChannelOptions::default().reporter(reporter.clone()),
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let flaky = ListenerInfo::fallible("flaky", move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ListenerError::new("not yet"))
            } else {
                Ok(())
            }
        })
        .times(1);
        channel.add_listener(flaky).unwrap();

        channel.send(Message::new(1)).unwrap();
        channel.send(Message::new(2)).unwrap();
        settle(&channel).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.len(), 1);
        assert_eq!(channel.hook_count(), 0);
    }

    #[tokio::test]
    async fn test_draining_while_listener_runs() {
        let channel = Channel::new("app", "events").unwrap();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        channel
            .add_listener(ListenerInfo::new("blocking", move |_| {
                let _ = started_tx.send(());
                if let Ok(rx) = release_rx.lock() {
                    let _ = rx.recv();
                }
            }))
            .unwrap();
        settle(&channel).await;
        assert!(!channel.is_draining());

        channel.send(Message::new("wait")).unwrap();
        tokio::time::timeout(WAIT, started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(channel.is_draining());

        release_tx.send(()).unwrap();
        settle(&channel).await;
        assert!(!channel.is_draining());
        assert_eq!(channel.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_channel() {
        let reporter = Arc::new(MemoryReporter::new());
        let channel = Channel::with_options(
            "app",
            "events",
            ChannelOptions::default().reporter(reporter.clone()),
        )
        .unwrap();
        channel
            .add_listener(ListenerInfo::new("panics", |_| panic!("listener blew up")))
            .unwrap();

        channel.send(Message::new(1)).unwrap();
        settle(&channel).await;

        assert_eq!(
            reporter.faults()[0].kind,
            FaultKind::Panicked("listener blew up".to_string())
        );

        let (late, mut late_rx) = forwarding("late");
        channel.add_listener(late).unwrap();
        channel.send(Message::new(2)).unwrap();
        settle(&channel).await;
        assert_eq!(reporter.len(), 2);
        assert_eq!(channel.status(), ChannelStatus::Open);
        assert!(late_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_listener_times_out() {
        let reporter = Arc::new(MemoryReporter::new());
        let config = ChannelConfig {
            listener_timeout_ms: Some(20),
            ..ChannelConfig::default()
        };
        let channel = Channel::with_options(
            "app",
            "events",
            ChannelOptions::with_config(config).reporter(reporter.clone()),
        )
        .unwrap();
        channel
            .add_listener(ListenerInfo::new("slow", |_| {
                std::thread::sleep(Duration::from_millis(200));
            }))
            .unwrap();

        channel.send(Message::new("tick")).unwrap();
        settle(&channel).await;

        assert_eq!(
            reporter.faults()[0].kind,
            FaultKind::TimedOut(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn test_overflow_reject() {
        let config = ChannelConfig {
            max_pending_messages: 2,
            start_on_hold: true,
            ..ChannelConfig::default()
        };
        let channel =
            Channel::with_options("app", "events", ChannelOptions::with_config(config)).unwrap();

        channel.send(Message::new(1)).unwrap();
        channel.send(Message::new(2)).unwrap();
        assert!(matches!(
            channel.send(Message::new(3)),
            Err(ChannelError::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(channel.pending_messages(), 2);
    }

    #[tokio::test]
    async fn test_overflow_drop_oldest() {
        let config = ChannelConfig {
            max_pending_messages: 2,
            overflow: OverflowPolicy::DropOldest,
            start_on_hold: true,
            ..ChannelConfig::default()
        };
        let channel =
            Channel::with_options("app", "events", ChannelOptions::with_config(config)).unwrap();

        let oldest = channel.send(Message::new(1)).unwrap();
        channel.send(Message::new(2)).unwrap();
        channel.send(Message::new(3)).unwrap();

        assert_eq!(channel.pending_messages(), 2);
        assert!(channel.message_info(&oldest).is_none());
    }

    #[tokio::test]
    async fn test_send_and_listen_sends_even_if_listener_invalid() {
        let channel = Channel::new("app", "events").unwrap();
        channel.hold();

        let outcome = channel.send_and_listen(Message::new("x"), ListenerInfo::default());
        assert!(matches!(
            outcome.listener,
            Err(ChannelError::InvalidListener(_))
        ));
        let message_id = outcome.message.unwrap();
        assert!(channel.message_info(&message_id).is_some());

        let (listener, mut rx) = forwarding("reply");
        let outcome = channel.send_and_listen(Message::new("y"), listener);
        assert!(outcome.listener.is_ok());
        channel.resume();
        settle(&channel).await;

        // The listener is promoted before the delivery sub-phase, so it also
        // sees the message queued earlier.
        assert_eq!(rx.try_recv().unwrap().payload, json!("x"));
        assert_eq!(rx.try_recv().unwrap().payload, json!("y"));
    }

    #[tokio::test]
    async fn test_hook_ids_are_distinct() {
        let channel = Channel::new("app", "events").unwrap();
        channel.add_listener(ListenerInfo::new("same", |_| {})).unwrap();
        channel.add_listener(ListenerInfo::new("same", |_| {})).unwrap();
        settle(&channel).await;

        let ids = channel.hook_ids();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_listener_can_send_to_its_own_channel() {
        let channel = Channel::new("app", "events").unwrap();
        let echo = {
            let channel = channel.clone();
            ListenerInfo::new("echo", move |message| {
                if message.payload == json!("ping") {
                    let _ = channel.send(Message::new("pong"));
                }
            })
        };
        channel.add_listener(echo).unwrap();
        let (listener, mut rx) = forwarding("observer");
        channel.add_listener(listener).unwrap();

        channel.send(Message::new("ping")).unwrap();
        assert_eq!(
            tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap().payload,
            json!("ping")
        );
        assert_eq!(
            tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap().payload,
            json!("pong")
        );
    }
}

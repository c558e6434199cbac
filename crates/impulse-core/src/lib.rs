//! # impulse-core
//!
//! Channels, the bus registry and transactional impulse dispatch for the
//! Impulse in-process message bus.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - Per-(entity, channel) delivery engine with hold/resume
//! - **Bus** - Registry of live channels impulses are routed through
//! - **Impulse** - Routed message envelope with transactional emit
//! - **CommunicationFlow** - Provenance log kept across emits
//! - **FaultReporter** - Where listener failures end up
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ emit ┌─────────────┐ send ┌─────────────┐
//! │   Impulse   │─────▶│     Bus     │─────▶│   Channel   │
//! └─────────────┘      └─────────────┘      └─────────────┘
//!        │                                         │ cycle
//!        ▼                                         ▼
//! ┌─────────────┐                           ┌─────────────┐
//! │    Flow     │                           │  Listeners  │
//! └─────────────┘                           └─────────────┘
//! ```
//!
//! Channels run their delivery cycles on the Tokio runtime they were created
//! in. Listeners run on the blocking pool, so a slow or panicking listener
//! never stalls the cycle of another channel.

pub mod bus;
pub mod channel;
pub mod config;
pub mod flow;
pub mod impulse;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod report;

pub use bus::{Bus, BusError, ChannelRegistry, RegistryStats};
pub use channel::{Channel, ChannelError, ChannelOptions, ChannelStatus, SendAndListen};
pub use config::{BusConfig, ChannelConfig, ConfigError, OverflowPolicy};
pub use flow::{CommunicationFlow, EmitContent, EmitRecord};
pub use impulse::{EmitError, Impulse, ImpulseError, ImpulseInfo, TraceOptions};
pub use listener::{Hook, Listener, ListenerError, ListenerInfo};
pub use message::{Message, ReplyEntry};
pub use queue::{Queue, QueueId, Record};
pub use report::{DeliveryFault, FaultKind, FaultReporter, MemoryReporter, TracingReporter};

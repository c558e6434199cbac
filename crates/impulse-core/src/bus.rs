//! The bus: a registry of live channels keyed by (entity, channel).
//!
//! Impulses only need to ask whether a destination exists and to get hold of
//! it, which is what the [`Bus`] trait expresses. [`ChannelRegistry`] is the
//! in-process implementation.

use crate::channel::{validate_name, Channel, ChannelError, ChannelOptions};
use crate::config::BusConfig;
use crate::metrics;
use crate::report::{FaultReporter, TracingReporter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Lookup surface impulses dispatch through.
pub trait Bus: Send + Sync {
    /// Whether a live channel exists for the pair.
    fn exists(&self, entity: &str, channel: &str) -> bool;

    /// Get the channel for the pair.
    fn get(&self, entity: &str, channel: &str) -> Option<Channel>;
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid entity or channel name.
    #[error("Invalid name: {0}")]
    InvalidName(&'static str),

    /// A channel already exists for the pair.
    #[error("Channel already exists: {entity}/{channel}")]
    ChannelExists { entity: String, channel: String },

    /// Maximum channels reached.
    #[error("Maximum channels reached ({0})")]
    MaxChannelsReached(usize),

    /// Channel creation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

type ChannelKey = (String, String);

/// In-process channel registry.
pub struct ChannelRegistry {
    channels: DashMap<ChannelKey, Channel>,
    config: BusConfig,
    reporter: Arc<dyn FaultReporter>,
}

impl ChannelRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        info!("Creating channel registry with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            config,
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Replace the fault reporter handed to channels created from now on.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn FaultReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Get the registry configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn options(&self) -> ChannelOptions {
        ChannelOptions::with_config(self.config.channel.clone()).reporter(Arc::clone(&self.reporter))
    }

    /// Create a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid, the pair is taken, the channel
    /// limit is reached, or no Tokio runtime is running.
    pub fn create(&self, entity: &str, channel: &str) -> Result<Channel, BusError> {
        self.create_with(entity, channel, self.options())
    }

    /// Create a channel with its own options.
    ///
    /// # Errors
    ///
    /// See [`ChannelRegistry::create`].
    pub fn create_with(
        &self,
        entity: &str,
        channel: &str,
        options: ChannelOptions,
    ) -> Result<Channel, BusError> {
        validate_name(entity).map_err(BusError::InvalidName)?;
        validate_name(channel).map_err(BusError::InvalidName)?;

        if self.channels.len() >= self.config.max_channels {
            return Err(BusError::MaxChannelsReached(self.config.max_channels));
        }

        let created = match self.channels.entry(key(entity, channel)) {
            Entry::Occupied(_) => {
                return Err(BusError::ChannelExists {
                    entity: entity.to_string(),
                    channel: channel.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let created = Channel::with_options(entity, channel, options)?;
                slot.insert(created.clone());
                created
            }
        };

        debug!(entity = %entity, channel = %channel, "Channel registered");
        metrics::set_active_channels(self.channels.len());
        Ok(created)
    }

    /// Get a channel, creating it if needed.
    ///
    /// # Errors
    ///
    /// See [`ChannelRegistry::create`].
    pub fn get_or_create(&self, entity: &str, channel: &str) -> Result<Channel, BusError> {
        if let Some(existing) = self.get(entity, channel) {
            return Ok(existing);
        }
        match self.create(entity, channel) {
            Err(BusError::ChannelExists { .. }) => self
                .get(entity, channel)
                .ok_or_else(|| BusError::ChannelExists {
                    entity: entity.to_string(),
                    channel: channel.to_string(),
                }),
            other => other,
        }
    }

    /// Remove a channel from the registry.
    ///
    /// The channel is closed; handles held elsewhere stay usable but the bus
    /// no longer routes to it.
    pub fn remove(&self, entity: &str, channel: &str) -> Option<Channel> {
        let (_, removed) = self.channels.remove(&key(entity, channel))?;
        removed.close();
        debug!(entity = %entity, channel = %channel, "Channel removed");
        metrics::set_active_channels(self.channels.len());
        Some(removed)
    }

    /// All registered (entity, channel) pairs.
    #[must_use]
    pub fn channel_names(&self) -> Vec<(String, String)> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            channel_count: self.channels.len(),
            ..RegistryStats::default()
        };
        for entry in self.channels.iter() {
            stats.hook_count += entry.value().hook_count();
            stats.pending_messages += entry.value().pending_messages();
        }
        stats
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for ChannelRegistry {
    fn exists(&self, entity: &str, channel: &str) -> bool {
        self.channels.contains_key(&key(entity, channel))
    }

    fn get(&self, entity: &str, channel: &str) -> Option<Channel> {
        self.channels
            .get(&key(entity, channel))
            .map(|entry| entry.value().clone())
    }
}

fn key(entity: &str, channel: &str) -> ChannelKey {
    (entity.to_string(), channel.to_string())
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Number of registered channels.
    pub channel_count: usize,
    /// Active hooks across all channels.
    pub hook_count: usize,
    /// Undelivered messages across all channels.
    pub pending_messages: usize,
}

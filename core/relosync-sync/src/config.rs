//! Configuration for the channel adapter and sync coordinator.

use crate::error::{SyncError, SyncResult};
use relosync_model::EntitySchema;
use relosync_types::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed delay between reconnection attempts (ms).
    pub reconnect_delay_ms: u64,
    /// Reconnection attempts before the channel gives up.
    pub max_reconnect_attempts: u32,
    /// Heartbeat ping interval (ms). Zero disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Timeout for acknowledged requests (ms).
    pub request_timeout_ms: u64,
    /// Timeout for a `sync:request` round-trip (ms).
    pub sync_timeout_ms: u64,
    /// Default timeout for optimistic mutations (ms).
    pub mutation_timeout_ms: u64,
    /// Delay before retrying a failed replay (ms).
    pub replay_retry_delay_ms: u64,
    /// Consecutive replay failures before a user-visible notice.
    pub replay_escalation_threshold: u32,
    /// Refresh every subscribed type after a reconnect.
    pub sync_on_reconnect: bool,
    /// Schema used for types without an explicit entry.
    pub default_schema: EntitySchema,
    /// Per-type schemas.
    pub schemas: HashMap<EntityType, EntitySchema>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 25_000,
            request_timeout_ms: 10_000,
            sync_timeout_ms: 30_000,
            mutation_timeout_ms: 10_000,
            replay_retry_delay_ms: 5_000,
            replay_escalation_threshold: 3,
            sync_on_reconnect: true,
            default_schema: EntitySchema::default(),
            schemas: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Parses a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Registers a schema for one entity type.
    #[must_use]
    pub fn with_schema(mut self, entity_type: impl Into<EntityType>, schema: EntitySchema) -> Self {
        self.schemas.insert(entity_type.into(), schema);
        self
    }

    /// Checks that the timeouts are usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be positive".into()));
        }
        if self.sync_timeout_ms == 0 {
            return Err(SyncError::Config("sync_timeout_ms must be positive".into()));
        }
        if self.mutation_timeout_ms == 0 {
            return Err(SyncError::Config("mutation_timeout_ms must be positive".into()));
        }
        if self.replay_escalation_threshold == 0 {
            return Err(SyncError::Config(
                "replay_escalation_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Schema for `entity_type`, falling back to the default schema.
    pub fn schema_for(&self, entity_type: &EntityType) -> &EntitySchema {
        self.schemas.get(entity_type).unwrap_or(&self.default_schema)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn replay_retry_delay(&self) -> Duration {
        Duration::from_millis(self.replay_retry_delay_ms)
    }

    /// The subset the channel adapter needs.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: (self.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat_interval_ms)),
            request_timeout: self.request_timeout(),
        }
    }
}

/// Connection settings for [`crate::ChannelAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Heartbeat interval, if enabled.
    pub heartbeat_interval: Option<Duration>,
    /// Acknowledgement timeout for `send`.
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        SyncConfig::default().channel_config()
    }
}

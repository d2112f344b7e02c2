//! Connection and coordinator state.
//!
//! [`ConnectionState`] is the process-wide snapshot pages read to render an
//! offline indicator. [`SyncNotice`]s are the user-visible escalations.

use relosync_types::{EntityKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the channel adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection gave up after the configured ceiling.
    Exhausted,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Exhausted => "exhausted",
        })
    }
}

/// Lifecycle of the sync coordinator.
///
/// `Uninitialized -> Connecting -> Connected <-> Disconnected -> Exhausted`.
/// `Exhausted` is terminal until the caller initializes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    #[default]
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Exhausted,
}

/// Snapshot of connectivity and sync progress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: CoordinatorState,
    pub connected: bool,
    pub reconnect_attempts: u32,
    /// A replay or sync round-trip is in flight.
    pub syncing: bool,
    pub last_sync_at: Option<Timestamp>,
    /// Mutations waiting in the offline queue.
    pub pending_updates: usize,
}

/// User-visible sync notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// Connection established or restored.
    Online,
    /// Connection lost; mutations are queued until it returns.
    Offline { reason: String },
    /// Reconnection stopped; the caller must initialize again.
    ReconnectExhausted { attempts: u32 },
    /// Replaying the offline queue failed repeatedly.
    ReplayFailed {
        failures: u32,
        pending: usize,
        error: String,
    },
    /// A server push overwrote an unconfirmed optimistic write.
    ReconciliationConflict { key: EntityKey },
}

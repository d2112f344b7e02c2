//! Real-time sync and optimistic cache engine for the relocation back office.
//!
//! Keeps a client-side cache of business entities (relocations, employees,
//! tasks) consistent with the server over one persistent channel, and lets
//! pages mutate it optimistically.
//!
//! # Architecture
//!
//! - **Channel**: connection lifecycle, bounded reconnection, heartbeat
//! - **Cache**: in-memory entity store keyed by `(type, id)`
//! - **Registry**: per-type change listeners with fault isolation
//! - **Coordinator**: applies pushes, owns the offline queue and its replay
//! - **Binding**: optimistic views with rollback on failure
//!
//! ## Sync Process
//!
//! 1. **Connect**: open the channel, re-subscribe active types
//! 2. **Replay**: send queued offline mutations as one `data:batch`
//! 3. **Refresh**: request a full sync of every subscribed type
//! 4. **Follow**: apply pushes to the cache and notify listeners
//!
//! # Example
//!
//! ```
//! use relosync_sync::{SyncConfig, SyncCoordinator, transport::mock::MockTransport};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> relosync_sync::SyncResult<()> {
//! let transport = Arc::new(MockTransport::new());
//! let coordinator = SyncCoordinator::new(SyncConfig::default(), transport)?;
//! coordinator.init("wss://sync.example.com", "token").await?;
//! assert!(coordinator.is_connected());
//! coordinator.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod applicator;
pub mod binding;
pub mod cache;
pub mod channel;
mod config;
pub mod coordinator;
mod error;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod state;
pub mod transport;

pub use applicator::{Applied, ChangeApplicator};
pub use binding::{EntityEndpoint, MutationOutcome, OptimisticView, ViewState};
pub use cache::{CacheEntry, EntityCache};
pub use channel::{ChannelAdapter, ChannelEvent};
pub use config::{ChannelConfig, SyncConfig};
pub use coordinator::{MutationAck, SubscribeOptions, SubscriptionHandle, SyncCoordinator};
pub use error::{SyncError, SyncResult};
pub use protocol::{Ack, ClientMessage, ErrorMessage, ServerMessage};
pub use queue::{Operation, PendingQueue, PendingUpdate};
pub use registry::{ChangeEvent, ChangeKind, Removal, SubscriptionId, SubscriptionRegistry};
pub use state::{ChannelStatus, ConnectionState, CoordinatorState, SyncNotice};
pub use transport::{ChannelTransport, TransportEvent};

// Re-exported so callers need not depend on the lower crates directly.
pub use relosync_model::{EntitySchema, MergeStrategy, Payload};
pub use relosync_types::{EntityId, EntityKey, EntityType, Timestamp};

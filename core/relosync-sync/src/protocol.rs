//! Wire protocol messages.
//!
//! Every frame on the channel is a JSON object `{ "event": <name>, "payload": <body> }`.
//! Outbound frames are [`ClientMessage`]s, inbound pushes are [`ServerMessage`]s.
//! Requests that expect an answer are acknowledged with an [`Ack`].
//!
//! Both enums are closed: a frame naming an unknown event fails to decode
//! instead of being dropped.

use crate::error::{SyncError, SyncResult};
use crate::queue::PendingUpdate;
use relosync_model::Payload;
use relosync_types::{EntityId, EntityType, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientMessage {
    /// Join the update group for an entity type.
    #[serde(rename = "subscribe")]
    Subscribe(SubscribeMessage),

    /// Leave the update group for an entity type.
    #[serde(rename = "unsubscribe")]
    Unsubscribe(UnsubscribeMessage),

    #[serde(rename = "data:create")]
    Create(CreateMessage),

    #[serde(rename = "data:update")]
    Update(UpdateMessage),

    #[serde(rename = "data:delete")]
    Delete(DeleteMessage),

    /// Replay of the offline queue.
    #[serde(rename = "data:batch")]
    Batch(BatchMessage),

    /// Ask for the complete entity list of a type.
    #[serde(rename = "sync:request")]
    SyncRequest(SyncRequestMessage),

    /// Heartbeat.
    #[serde(rename = "ping")]
    Ping(u64),
}

impl ClientMessage {
    /// The wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Create(_) => "data:create",
            Self::Update(_) => "data:update",
            Self::Delete(_) => "data:delete",
            Self::Batch(_) => "data:batch",
            Self::SyncRequest(_) => "sync:request",
            Self::Ping(_) => "ping",
        }
    }

    /// The entity type the frame concerns, if it names exactly one.
    pub fn entity_type(&self) -> Option<&EntityType> {
        match self {
            Self::Subscribe(m) => Some(&m.entity_type),
            Self::Unsubscribe(m) => Some(&m.entity_type),
            Self::Create(m) => Some(&m.entity_type),
            Self::Update(m) => Some(&m.entity_type),
            Self::Delete(m) => Some(&m.entity_type),
            Self::SyncRequest(m) => Some(&m.entity_type),
            Self::Batch(_) | Self::Ping(_) => None,
        }
    }
}

/// A frame pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "data:create")]
    Create(CreateMessage),

    #[serde(rename = "data:update")]
    Update(UpdateMessage),

    #[serde(rename = "data:delete")]
    Delete(DeleteMessage),

    /// Several changes forming one transaction, applied in list order.
    #[serde(rename = "data:batch")]
    Batch(BatchMessage),

    /// Authoritative entity list for one type.
    #[serde(rename = "sync:response")]
    SyncResponse(SyncResponseMessage),

    /// Server-side error notification.
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

impl ServerMessage {
    /// The wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Create(_) => "data:create",
            Self::Update(_) => "data:update",
            Self::Delete(_) => "data:delete",
            Self::Batch(_) => "data:batch",
            Self::SyncResponse(_) => "sync:response",
            Self::Error(_) => "error",
        }
    }
}

/// `subscribe` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    pub entity_type: EntityType,
    #[serde(default)]
    pub options: Payload,
}

/// `unsubscribe` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeMessage {
    pub entity_type: EntityType,
}

/// `data:create` body, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    pub entity_type: EntityType,
    pub entity: Payload,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl CreateMessage {
    pub fn new(entity_type: EntityType, entity: Payload) -> Self {
        Self {
            entity_type,
            entity,
            timestamp: Timestamp::now(),
        }
    }
}

/// `data:update` body, in either direction. `updates` is a partial patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub updates: Payload,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl UpdateMessage {
    pub fn new(entity_type: EntityType, entity_id: EntityId, updates: Payload) -> Self {
        Self {
            entity_type,
            entity_id,
            updates,
            timestamp: Timestamp::now(),
        }
    }
}

/// `data:delete` body, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl DeleteMessage {
    pub fn new(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            entity_type,
            entity_id,
            timestamp: Timestamp::now(),
        }
    }
}

/// `data:batch` body, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    pub updates: Vec<PendingUpdate>,
}

/// `sync:request` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub entity_type: EntityType,
    #[serde(default)]
    pub options: Payload,
}

/// `sync:response` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMessage {
    pub entity_type: EntityType,
    pub entities: Vec<Payload>,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// Error pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    #[serde(default)]
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorMessage {
    /// Creates a new error message.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Acknowledgement of a client request: `{ success, data?, error? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// A successful acknowledgement.
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// A rejecting acknowledgement.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Converts into the acknowledged data, or [`SyncError::Rejected`].
    pub fn into_result(self) -> SyncResult<Option<Value>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(SyncError::Rejected(
                self.error.unwrap_or_else(|| "unspecified error".to_string()),
            ))
        }
    }
}

/// Encodes a client frame as JSON text.
pub fn encode_client(message: &ClientMessage) -> SyncResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a server frame from JSON text.
pub fn decode_server(text: &str) -> SyncResult<ServerMessage> {
    serde_json::from_str(text).map_err(|e| SyncError::Protocol(format!("undecodable frame: {e}")))
}

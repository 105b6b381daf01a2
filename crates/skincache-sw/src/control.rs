//! Control channel and update broadcast.
//!
//! Pages talk to the worker with JSON objects keyed by `type`. Requests that
//! expect an answer carry their own one-shot reply channel; the worker pushes
//! `DATA_UPDATED` notices to every open tab through a broadcast channel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::store::PartitionStatus;

/// Capacity of the update broadcast; slow tabs skip older notices.
const BROADCAST_CAPACITY: usize = 64;

/// Message from a page to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate the waiting worker now.
    SkipWaiting,
    /// Delete every partition; replies [`ClearCacheReply`].
    ClearCache,
    /// Report usage; replies [`CacheStatus`].
    GetCacheStatus,
}

impl ControlMessage {
    /// Parse a page message. Unknown or malformed messages are logged and
    /// yield `None`.
    pub fn parse(data: &Value) -> Option<Self> {
        match serde_json::from_value::<Self>(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                match data.get("type").and_then(Value::as_str) {
                    Some(kind) => warn!(kind, "Ignoring unknown control message"),
                    None => warn!(error = %e, "Ignoring malformed control message"),
                }
                None
            }
        }
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::SkipWaiting)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Reply to `CLEAR_CACHE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCacheReply {
    pub success: bool,
}

/// Usage of one partition in a `GET_CACHE_STATUS` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub count: usize,
    pub size: u64,
}

/// Reply to `GET_CACHE_STATUS`, keyed by partition name.
pub type CacheStatus = BTreeMap<String, PartitionUsage>;

/// Build a status reply from store statistics.
pub fn cache_status(statuses: Vec<PartitionStatus>) -> CacheStatus {
    statuses
        .into_iter()
        .map(|s| {
            (
                s.name,
                PartitionUsage {
                    count: s.count,
                    size: s.size,
                },
            )
        })
        .collect()
}

// ==================== Broadcast ====================

/// Notice pushed to every open tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastMessage {
    /// Fresh data for `url` was stored at `timestamp` (epoch ms).
    #[serde(rename = "DATA_UPDATED")]
    DataUpdated { url: String, timestamp: u64 },
}

/// Publish/subscribe channel for [`BroadcastMessage`]s.
#[derive(Debug, Clone)]
pub struct UpdateBroadcaster {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl UpdateBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    /// Deliver to every current subscriber. Returns how many received it.
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        match self.tx.send(message) {
            Ok(receivers) => {
                debug!(receivers, "Broadcast sent");
                receivers
            }
            Err(_) => {
                debug!("Broadcast dropped, no open tabs");
                0
            }
        }
    }
}

impl Default for UpdateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

//! Tracks the set of nodes the controller has announced online, keyed by
//! the hostname it advertised for each. Parses the `NodeOnline` /
//! `NodeOffline` control message bodies.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{Result, SiphonError};
use crate::forwarding::NodeId;

#[derive(Debug, Deserialize)]
struct OnlineEntry {
    #[serde(rename = "NodeID")]
    node_id: NodeId,
    #[serde(rename = "Hostname")]
    hostname: String,
}

#[derive(Debug, Deserialize)]
struct OfflineBody {
    #[serde(rename = "NodeID")]
    node_id: NodeId,
}

/// The online-node set. A plain `RwLock<HashMap>` stands in for the
/// original's member map guarded by the controller's single-consumer
/// strand — here the controller dispatch path is itself already
/// single-consumer, but the lock lets other components (e.g. a metrics
/// dump) read the set concurrently.
pub struct NodeManager {
    online: RwLock<HashMap<NodeId, String>>,
}

impl NodeManager {
    pub fn new() -> Self {
        NodeManager {
            online: RwLock::new(HashMap::new()),
        }
    }

    /// Parses a `NodeOnline` message body (an array of `{NodeID,
    /// Hostname}` pairs), inserts every entry, and returns exactly the
    /// newly-added `(node_id, hostname)` pairs for the caller to act on.
    pub fn new_online_nodes(&self, msg: &serde_json::Value) -> Result<Vec<(NodeId, String)>> {
        let entries: Vec<OnlineEntry> = serde_json::from_value(msg.clone())
            .map_err(|e| SiphonError::ProtocolViolation(format!("malformed NodeOnline body: {e}")))?;
        let mut fresh = Vec::new();
        let mut online = self.online.write();
        for entry in entries {
            if online.insert(entry.node_id, entry.hostname.clone()).is_none() {
                fresh.push((entry.node_id, entry.hostname));
            }
        }
        Ok(fresh)
    }

    /// Parses a `NodeOffline` message body and removes the node from
    /// the online set, returning its id.
    pub fn node_offline(&self, msg: &serde_json::Value) -> Result<NodeId> {
        let body: OfflineBody = serde_json::from_value(msg.clone())
            .map_err(|e| SiphonError::ProtocolViolation(format!("malformed NodeOffline body: {e}")))?;
        self.online.write().remove(&body.node_id);
        Ok(body.node_id)
    }

    pub fn is_online(&self, node_id: NodeId) -> bool {
        self.online.read().contains_key(&node_id)
    }

    pub fn hostname_of(&self, node_id: NodeId) -> Option<String> {
        self.online.read().get(&node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.online.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

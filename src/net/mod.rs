//! Per-peer transport: TCP or UDP endpoint pairs, framing, async send
//! serialization, and (UDP) per-session coder hooks.

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::crossbar::ConnectionManager as CrossbarConnectionManager;
use crate::forwarding::NodeId;
use crate::minion::Stop;

/// For a peer pair, exactly one side initiates, canonicalized over the
/// unordered pair `(min(a,b), max(a,b))`: if the pair's sum is even the
/// lower id initiates, otherwise the higher id does. This is symmetric —
/// both peers compute the same answer independently — and eliminates
/// both connection races and duplicate links.
pub fn tie_break_initiator(a: NodeId, b: NodeId) -> NodeId {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    if (lo + hi) % 2 == 0 {
        lo
    } else {
        hi
    }
}

pub fn should_initiate_connection(local: NodeId, peer: NodeId) -> bool {
    local != peer && tie_break_initiator(local, peer) == local
}

/// Extends the crossbar's read-only view of the connection manager with
/// the mutations the controller-proxy dispatch path needs.
#[async_trait]
pub trait ConnectionManager: CrossbarConnectionManager {
    async fn create(self: Arc<Self>, hostname: String, node_id: NodeId);
    fn should_initiate_connection_to(&self, node_id: NodeId) -> bool;
    fn remove(&self, node_id: NodeId);
}

/// Shared handle to whatever stop should receive a minion once it has
/// been dispatched to a peer sender.
pub type SenderHandle = Arc<dyn Stop>;

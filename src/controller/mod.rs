//! Proxy for the remote centralized controller: treated locally as "the
//! controller", translating its JSON protocol into calls against the
//! node manager, forwarding table, and connection manager.

pub mod connection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::crossbar::{Crossbar, QueryForwardingEntry};
use crate::error::Result;
use crate::forwarding::{parse_entry, NodeId};
use crate::net::ConnectionManager;
use crate::node_manager::NodeManager;
use crate::notify::Observer;

/// The pointers wired in after construction, once the rest of the
/// aggregator has been built. Mirrors the original's constructor/`setup`
/// split: the controller link is opened (and the local node id learned)
/// before the node manager, crossbar, and connection manager even exist.
#[derive(Clone)]
struct Wiring {
    node_manager: Arc<NodeManager>,
    crossbar: Arc<Crossbar>,
    connections: Arc<dyn ConnectionManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ControlMsgType {
    NodeOnline = 1,
    NodeOffline = 2,
    Routing = 3,
    Rtt = 4,
    Bandwidth = 5,
    SessionSubscribed = 6,
    QuerySessionId = 7,
    NewSession = 8,
    SetSessionWeight = 9,
}

impl ControlMsgType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::NodeOnline,
            2 => Self::NodeOffline,
            3 => Self::Routing,
            4 => Self::Rtt,
            5 => Self::Bandwidth,
            6 => Self::SessionSubscribed,
            7 => Self::QuerySessionId,
            8 => Self::NewSession,
            9 => Self::SetSessionWeight,
            _ => return None,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "Type")]
    ty: u32,
    #[serde(rename = "Msg")]
    msg: &'a Value,
}

#[derive(serde::Deserialize)]
struct RoutingBody {
    #[serde(rename = "SessionID")]
    session_id: String,
    #[serde(rename = "Entry")]
    entry: Value,
    #[serde(rename = "Timeout")]
    timeout: Option<u64>,
}

/// The local stand-in for the centralized controller. Holds the pointers
/// `dispatchControlMsgToComponent` fans inbound messages out to, and is
/// itself the sole observer of the crossbar's forwarding-miss queries.
pub struct ControllerProxy {
    local_node_id: NodeId,
    wiring: RwLock<Option<Wiring>>,
    out_tx: mpsc::Sender<Value>,
    fatal: Notify,
}

impl ControllerProxy {
    /// Connects to the controller and performs the handshake, spawning the
    /// inbound dispatch loop. The proxy won't act on anything received
    /// until [`ControllerProxy::setup`] runs.
    pub async fn connect(host: &str, port: u16, local_hostname: String) -> Result<Arc<Self>> {
        let (local_node_id, out_tx, mut in_rx) =
            connection::connect_and_start(host, port, local_hostname).await?;
        info!(local_node_id, "local node started");

        let proxy = Arc::new(ControllerProxy {
            local_node_id,
            wiring: RwLock::new(None),
            out_tx,
            fatal: Notify::new(),
        });

        let dispatch_proxy = proxy.clone();
        tokio::spawn(async move {
            while let Some(envelope) = in_rx.recv().await {
                dispatch_proxy.on_control_msg_received(envelope).await;
            }
            // Any failure on the control connection after connect is fatal
            // by design (spec.md's error-handling policy, kind 5).
            error!("controller connection lost, this is fatal");
            dispatch_proxy.fatal.notify_waiters();
        });

        Ok(proxy)
    }

    /// Resolves once the control connection is lost after a successful
    /// connect — the one condition spec.md's error model treats as fatal
    /// for the whole process. The aggregator blocks on this as its
    /// `waitUntilErrorDetected` equivalent.
    pub async fn wait_fatal(&self) {
        self.fatal.notified().await;
    }

    /// Wires in the components the dispatch path needs. Must run once,
    /// before any control message handling can take effect.
    pub fn setup(
        &self,
        node_manager: Arc<NodeManager>,
        crossbar: Arc<Crossbar>,
        connections: Arc<dyn ConnectionManager>,
    ) {
        *self.wiring.write() = Some(Wiring {
            node_manager,
            crossbar,
            connections,
        });
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    async fn on_control_msg_received(&self, envelope: Value) {
        let (ty, msg) = match (envelope.get("Type").and_then(Value::as_u64), envelope.get("Msg")) {
            (Some(ty), Some(msg)) if msg.is_object() => (ty as u32, msg.clone()),
            _ => {
                error!(?envelope, "malformed control message, discarding");
                return;
            }
        };
        let Some(ty) = ControlMsgType::from_u32(ty) else {
            error!(ty, "unknown ControlMsgType, discarding");
            return;
        };
        self.dispatch_to_component(ty, &msg).await;
    }

    async fn dispatch_to_component(&self, ty: ControlMsgType, msg: &Value) {
        let Some(wiring) = self.wiring.read().clone() else {
            warn!("control message received before setup(), discarding");
            return;
        };

        match ty {
            ControlMsgType::NodeOnline => {
                let fresh = match wiring.node_manager.new_online_nodes(msg) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        error!(error = %e, "malformed NodeOnline body");
                        return;
                    }
                };
                for (node_id, hostname) in fresh {
                    if node_id == self.local_node_id {
                        continue;
                    }
                    if wiring.connections.should_initiate_connection_to(node_id) {
                        info!(node_id, "initiating connection to peer");
                        wiring.connections.clone().create(hostname, node_id).await;
                    }
                }
            }
            ControlMsgType::NodeOffline => match wiring.node_manager.node_offline(msg) {
                Ok(node_id) => wiring.connections.remove(node_id),
                Err(e) => error!(error = %e, "malformed NodeOffline body"),
            },
            ControlMsgType::Routing => {
                let body: RoutingBody = match serde_json::from_value(msg.clone()) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(error = %e, "malformed Routing body");
                        return;
                    }
                };
                let entry = match parse_entry(&body.session_id, &body.entry) {
                    Ok(e) => e,
                    Err(e) => {
                        error!(error = %e, "failed to decode forwarding entry");
                        return;
                    }
                };
                let ttl = body.timeout.map(Duration::from_secs);
                wiring.crossbar.install_forwarding_table_entry(body.session_id, entry, ttl);
            }
            ControlMsgType::SetSessionWeight => {
                warn!("unsupported op: set session weight");
            }
            ControlMsgType::Rtt
            | ControlMsgType::Bandwidth
            | ControlMsgType::SessionSubscribed
            | ControlMsgType::QuerySessionId
            | ControlMsgType::NewSession => {
                // Accepted only as outbound notifications; an inbound copy
                // of one of these types is not meaningful here.
            }
        }
    }

    fn send_control_msg(&self, ty: ControlMsgType, msg: Value) {
        let envelope = serde_json::to_value(Envelope { ty: ty as u32, msg: &msg })
            .expect("Envelope serialization cannot fail");
        if self.out_tx.try_send(envelope).is_err() {
            warn!("controller outbox full or closed, dropping outbound notification");
        }
    }
}

#[async_trait]
impl Observer<QueryForwardingEntry> for ControllerProxy {
    async fn handle(&self, query: QueryForwardingEntry) {
        self.send_control_msg(
            ControlMsgType::QuerySessionId,
            serde_json::json!({"SessionID": query.session_id}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PendingPacketArchive;
    use crate::forwarding::ForwardingTable;
    use crate::minion::{MinionPool, Stop};
    use crate::notify::NotificationBus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct NoOpConnections;
    #[async_trait]
    impl crate::crossbar::ConnectionManager for NoOpConnections {
        async fn get_sender(&self, _node_id: NodeId) -> Option<Arc<dyn Stop>> {
            None
        }
    }
    #[async_trait]
    impl ConnectionManager for NoOpConnections {
        async fn create(self: Arc<Self>, _hostname: String, _node_id: NodeId) {}
        fn should_initiate_connection_to(&self, _node_id: NodeId) -> bool {
            false
        }
        fn remove(&self, _node_id: NodeId) {}
    }

    #[tokio::test]
    async fn routing_message_installs_forwarding_table_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_ne_bytes(len_buf) as usize;
            let mut hostname_buf = vec![0u8; len];
            stream.read_exact(&mut hostname_buf).await.unwrap();
            stream.write_all(&7u32.to_ne_bytes()).await.unwrap();

            // Give the test time to finish wiring setup() before the
            // Routing message arrives.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            let mut frame = serde_json::to_vec(&serde_json::json!({
                "Type": 3,
                "Msg": {"SessionID": "X", "Entry": [2]}
            }))
            .unwrap();
            frame.push(0);
            stream.write_all(&frame).await.unwrap();
            stream
        });

        let proxy = ControllerProxy::connect("127.0.0.1", addr.port(), "test-host".into())
            .await
            .unwrap();
        assert_eq!(proxy.local_node_id(), 7);

        let pool = MinionPool::new(4, 1024);
        let table = ForwardingTable::new();
        let archive = PendingPacketArchive::new();
        let node_manager = Arc::new(NodeManager::new());
        let bus = NotificationBus::new(proxy.clone());
        let crossbar = Crossbar::new(
            7,
            table.clone(),
            archive,
            pool.clone() as Arc<dyn Stop>,
            pool.clone() as Arc<dyn Stop>,
            Arc::new(NoOpConnections),
            bus,
        );
        proxy.setup(node_manager, crossbar, Arc::new(NoOpConnections));

        for _ in 0..50 {
            if table.contains("X") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(table.contains("X"));
        server.abort();
    }
}

//! TCP peer transport: stream socket with `TCP_NODELAY`, one sender and
//! one receiver per peer, connect-or-accept chosen by the parity
//! tie-break.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::crossbar::ConnectionManager as CrossbarConnectionManager;
use crate::forwarding::NodeId;
use crate::message::WireSlices;
use crate::minion::{run_chain, Minion, MinionPool, Stop};
use crate::net::{should_initiate_connection, ConnectionManager};

const SENDER_OUTBOX_CAPACITY: usize = 256;

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&TcpKeepalive::new());
}

async fn write_frame(write_half: &mut OwnedWriteHalf, wire: &WireSlices) -> std::io::Result<()> {
    write_half.write_all(&wire.message_size).await?;
    write_half.write_all(&wire.header_size).await?;
    write_half.write_all(&wire.header_bytes).await?;
    write_half.write_all(&wire.payload).await
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// The per-peer sender stop: stamps header fields and queues the minion
/// into a bounded outbox. A dedicated writer task is the outbox's single
/// consumer, issuing at most one outstanding write at a time.
pub struct TcpSender {
    peer_node_id: NodeId,
    local_node_id: NodeId,
    outbox: mpsc::Sender<Box<Minion>>,
}

impl TcpSender {
    fn spawn(
        peer_node_id: NodeId,
        local_node_id: NodeId,
        write_half: OwnedWriteHalf,
        pool: Arc<MinionPool>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Box<Minion>>(SENDER_OUTBOX_CAPACITY);
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(mut minion) = rx.recv().await {
                minion.message.header_mut().timestamp = now_micros();
                let wire = minion.message.to_buffer();
                if let Err(e) = write_frame(&mut write_half, &wire).await {
                    warn!(node_id = peer_node_id, error = %e, "peer write failed, dropping sender");
                    break;
                }
                let extra: Vec<_> = minion.extra_messages.drain(..).collect();
                for mut extra_msg in extra {
                    let wire = extra_msg.to_buffer();
                    if write_frame(&mut write_half, &wire).await.is_err() {
                        break;
                    }
                }
                run_chain(pool.clone(), minion).await;
            }
        });
        Arc::new(TcpSender {
            peer_node_id,
            local_node_id,
            outbox: tx,
        })
    }
}

#[async_trait]
impl Stop for TcpSender {
    async fn process(self: Arc<Self>, mut minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        {
            let header = minion.message.header_mut();
            header.src = self.local_node_id;
            header.dst = self.peer_node_id;
            header.ack = false;
        }
        if self.outbox.send(minion).await.is_err() {
            debug!(node_id = self.peer_node_id, "sender outbox closed");
        }
        None
    }
}

async fn receiver_loop(
    mut read_half: OwnedReadHalf,
    peer_node_id: NodeId,
    pool: Arc<MinionPool>,
    crossbar: Arc<dyn Stop>,
) {
    loop {
        let mut size_buf = [0u8; 4];
        if read_half.read_exact(&mut size_buf).await.is_err() {
            info!(node_id = peer_node_id, "peer connection closed");
            return;
        }
        let message_size = u32::from_ne_bytes(size_buf) as usize;
        let mut rest = vec![0u8; message_size];
        if read_half.read_exact(&mut rest).await.is_err() {
            warn!(node_id = peer_node_id, "peer connection closed mid-frame");
            return;
        }

        let mut minion = pool.acquire().await;
        {
            let primary = minion.message.primary_mut();
            primary.clear();
            primary.extend_from_slice(&rest);
        }
        if let Err(e) = minion.message.from_buffer(false) {
            error!(node_id = peer_node_id, error = %e, "malformed frame from peer, dropping");
            run_chain(pool.clone(), minion).await;
            continue;
        }
        debug_assert!(!minion.message.header().ack, "TCP data link never carries acks");

        tokio::spawn(run_chain(crossbar.clone(), minion));
    }
}

struct PeerLink {
    sender: Arc<TcpSender>,
}

pub struct TcpConnectionManager {
    local_node_id: NodeId,
    pool: Arc<MinionPool>,
    crossbar: RwLock<Option<Arc<dyn Stop>>>,
    peers: RwLock<HashMap<NodeId, PeerLink>>,
}

impl TcpConnectionManager {
    pub fn new(local_node_id: NodeId, pool: Arc<MinionPool>) -> Arc<Self> {
        Arc::new(TcpConnectionManager {
            local_node_id,
            pool,
            crossbar: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
        })
    }

    pub fn init(&self, crossbar: Arc<dyn Stop>) {
        *self.crossbar.write() = Some(crossbar);
    }

    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.accept_connection(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed, listener shutting down");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        tune_socket(&stream);
        let mut stream = stream;
        let mut id_buf = [0u8; 4];
        if let Err(e) = stream.read_exact(&mut id_buf).await {
            warn!(peer = %peer_addr, error = %e, "handshake read failed");
            return;
        }
        let peer_node_id = u32::from_ne_bytes(id_buf);
        info!(node_id = peer_node_id, peer = %peer_addr, "accepted peer connection");
        self.install(peer_node_id, stream);
    }

    /// Connects out to `addr` and announces the local node id, used when
    /// the tie-break says this node initiates.
    pub async fn connect_to(self: &Arc<Self>, addr: SocketAddr, peer_node_id: NodeId) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(addr).await?;
        tune_socket(&stream);
        stream.write_all(&self.local_node_id.to_ne_bytes()).await?;
        info!(node_id = peer_node_id, %addr, "connected to peer");
        self.install(peer_node_id, stream);
        Ok(())
    }

    fn install(self: &Arc<Self>, peer_node_id: NodeId, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let sender = TcpSender::spawn(peer_node_id, self.local_node_id, write_half, self.pool.clone());
        let crossbar = self
            .crossbar
            .read()
            .clone()
            .expect("ConnectionManager::init must run before accepting/connecting peers");
        tokio::spawn(receiver_loop(read_half, peer_node_id, self.pool.clone(), crossbar));
        self.peers.write().insert(peer_node_id, PeerLink { sender });
    }
}

#[async_trait]
impl CrossbarConnectionManager for TcpConnectionManager {
    async fn get_sender(&self, node_id: NodeId) -> Option<Arc<dyn Stop>> {
        self.peers.read().get(&node_id).map(|p| p.sender.clone() as Arc<dyn Stop>)
    }
}

#[async_trait]
impl ConnectionManager for TcpConnectionManager {
    async fn create(self: Arc<Self>, hostname: String, node_id: NodeId) {
        let addr: SocketAddr = match hostname.parse() {
            Ok(a) => a,
            Err(e) => {
                error!(%hostname, error = %e, "cannot parse peer address");
                return;
            }
        };
        if let Err(e) = self.connect_to(addr, node_id).await {
            warn!(%addr, node_id, error = %e, "outbound connect failed");
        }
    }

    fn should_initiate_connection_to(&self, node_id: NodeId) -> bool {
        should_initiate_connection(self.local_node_id, node_id)
    }

    fn remove(&self, node_id: NodeId) {
        self.peers.write().remove(&node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minion::MinionPool;

    #[tokio::test]
    async fn tcp_round_trip_delivers_frame_between_two_nodes() {
        let pool_a = MinionPool::new(8, 4096);
        let pool_b = MinionPool::new(8, 4096);

        let mgr_a = TcpConnectionManager::new(3, pool_a.clone());
        let mgr_b = TcpConnectionManager::new(4, pool_b.clone());

        let sink_a: Arc<dyn Stop> = pool_a.clone() as Arc<dyn Stop>;
        let sink_b: Arc<dyn Stop> = pool_b.clone() as Arc<dyn Stop>;
        mgr_a.init(sink_a);
        mgr_b.init(sink_b);

        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(listen_addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        drop(listener);
        mgr_b.listen(bound_addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        mgr_a.connect_to(bound_addr, 4).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let sender = mgr_a.get_sender(4).await.expect("sender installed");
        let mut minion = pool_a.acquire().await;
        {
            let buf = minion.message.allocate_buffer();
            buf.extend_from_slice(b"hello-peer");
            minion.message.reset_payload(true, (0, 10));
            minion.message.header_mut().session_id = "S".into();
        }
        run_chain(sender, minion).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[test]
    fn tie_break_matches_documented_example() {
        assert!(should_initiate_connection(4, 3));
    }
}

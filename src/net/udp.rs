//! UDP peer transport: one shared datagram socket per node. Per-peer
//! "senders" are logical and share the socket; the receiver routes
//! piggybacked acks back to the right sender's encoder.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::coder::direct_pass::{DirectPassDecoder, DirectPassEncoder};
use crate::coder::{UdpDecoder, UdpEncoder};
use crate::crossbar::ConnectionManager as CrossbarConnectionManager;
use crate::forwarding::NodeId;
use crate::message::Header;
use crate::minion::{run_chain, Minion, MinionPool, Stop};

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn make_encoder(coder_name: &str) -> Arc<dyn UdpEncoder> {
    if coder_name != "DirectPass" && coder_name != "test" {
        debug!(coder_name, "no concrete coder registered for this name, using DirectPass");
    }
    Arc::new(DirectPassEncoder::default())
}

fn make_decoder(coder_name: &str) -> Arc<dyn UdpDecoder> {
    if coder_name != "DirectPass" && coder_name != "test" {
        debug!(coder_name, "no concrete coder registered for this name, using DirectPass");
    }
    Arc::new(DirectPassDecoder::default())
}

fn build_ack_datagram(header: &Header, coding_parameters: u32) -> Vec<u8> {
    let mut ack_header = header.clone();
    ack_header.ack = true;
    ack_header.payload_size = 0;
    ack_header.coding_parameters = coding_parameters;
    let header_bytes = ack_header.serialize();
    let header_size = header_bytes.len() as u16;
    let message_size = header_size as u32 + 2;
    let mut out = Vec::with_capacity(4 + 2 + header_bytes.len());
    out.extend_from_slice(&message_size.to_ne_bytes());
    out.extend_from_slice(&header_size.to_ne_bytes());
    out.extend_from_slice(&header_bytes);
    out
}

/// The logical per-peer sender; all peers share the node's one UDP
/// socket for transmission.
pub struct UdpSender {
    peer_node_id: NodeId,
    local_node_id: NodeId,
    peer_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    pool: Arc<MinionPool>,
    coder_name: String,
    encoders: RwLock<HashMap<String, Arc<dyn UdpEncoder>>>,
}

impl UdpSender {
    fn encoder_for(&self, session_id: &str) -> Arc<dyn UdpEncoder> {
        if let Some(e) = self.encoders.read().get(session_id) {
            return e.clone();
        }
        self.encoders
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| make_encoder(&self.coder_name))
            .clone()
    }

    /// Feeds piggybacked feedback from a received ack into the named
    /// session's encoder.
    pub fn on_ack(&self, session_id: &str, coding_parameters: u32) {
        self.encoder_for(session_id).set_parameters(coding_parameters);
    }
}

#[async_trait]
impl Stop for UdpSender {
    async fn process(self: Arc<Self>, mut minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        {
            let header = minion.message.header_mut();
            header.src = self.local_node_id;
            header.dst = self.peer_node_id;
            header.ack = false;
        }
        let session_id = minion.message.header().session_id.clone();
        let encoder = self.encoder_for(&session_id);
        if !encoder.encode(&mut minion) {
            return Some((self.pool.clone() as Arc<dyn Stop>, minion));
        }
        minion.message.header_mut().timestamp = now_micros();
        let wire = minion.message.to_buffer();
        if let Err(e) = self.socket.send_to(&wire.to_contiguous(), self.peer_addr).await {
            warn!(node_id = self.peer_node_id, error = %e, "udp send failed");
        }
        let extras: Vec<_> = minion.extra_messages.drain(..).collect();
        for mut extra in extras {
            let wire = extra.to_buffer();
            let _ = self.socket.send_to(&wire.to_contiguous(), self.peer_addr).await;
        }
        Some((self.pool.clone() as Arc<dyn Stop>, minion))
    }
}

pub struct UdpTransport {
    local_node_id: NodeId,
    socket: Arc<UdpSocket>,
    pool: Arc<MinionPool>,
    coder_name: String,
    crossbar: RwLock<Option<Arc<dyn Stop>>>,
    senders: RwLock<HashMap<NodeId, Arc<UdpSender>>>,
    decoders: RwLock<HashMap<String, Arc<dyn UdpDecoder>>>,
    peer_endpoints: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl UdpTransport {
    pub async fn bind(
        local_node_id: NodeId,
        addr: SocketAddr,
        pool: Arc<MinionPool>,
        coder_name: String,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Arc::new(UdpTransport {
            local_node_id,
            socket,
            pool,
            coder_name,
            crossbar: RwLock::new(None),
            senders: RwLock::new(HashMap::new()),
            decoders: RwLock::new(HashMap::new()),
            peer_endpoints: RwLock::new(HashMap::new()),
        }))
    }

    pub fn init(self: &Arc<Self>, crossbar: Arc<dyn Stop>) {
        *self.crossbar.write() = Some(crossbar);
        let this = self.clone();
        tokio::spawn(async move { this.recv_loop().await });
    }

    fn decoder_for(&self, session_id: &str) -> Arc<dyn UdpDecoder> {
        if let Some(d) = self.decoders.read().get(session_id) {
            return d.clone();
        }
        self.decoders
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| make_decoder(&self.coder_name))
            .clone()
    }

    /// Always creates the sender eagerly (UDP never creates a second
    /// socket; senders are just routing state over the shared one).
    pub fn create_sender(self: &Arc<Self>, peer_node_id: NodeId, peer_addr: SocketAddr) {
        self.peer_endpoints.write().insert(peer_node_id, peer_addr);
        let sender = Arc::new(UdpSender {
            peer_node_id,
            local_node_id: self.local_node_id,
            peer_addr,
            socket: self.socket.clone(),
            pool: self.pool.clone(),
            coder_name: self.coder_name.clone(),
            encoders: RwLock::new(HashMap::new()),
        });
        self.senders.write().insert(peer_node_id, sender);
    }

    pub fn remove(&self, node_id: NodeId) {
        self.senders.write().remove(&node_id);
        self.peer_endpoints.write().remove(&node_id);
    }

    pub fn get_sender(&self, node_id: NodeId) -> Option<Arc<dyn Stop>> {
        self.senders.read().get(&node_id).map(|s| s.clone() as Arc<dyn Stop>)
    }

    async fn recv_loop(self: Arc<Self>) {
        let max_size = {
            // receive buffer generously larger than any configured payload;
            // actual framing is self-describing via the size prefix.
            65536usize
        };
        let mut buf = vec![0u8; max_size];
        let crossbar = self
            .crossbar
            .read()
            .clone()
            .expect("UdpTransport::init must be called before recv_loop runs");
        loop {
            let (n, peer_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "udp recv failed, receiver shutting down");
                    return;
                }
            };
            let mut minion = self.pool.acquire().await;
            {
                let primary = minion.message.primary_mut();
                primary.clear();
                primary.extend_from_slice(&buf[..n]);
            }
            if let Err(e) = minion.message.from_buffer(true) {
                error!(error = %e, "malformed udp datagram, dropping");
                run_chain(self.pool.clone(), minion).await;
                continue;
            }

            if minion.message.header().ack {
                let dst = minion.message.header().dst;
                let session_id = minion.message.header().session_id.clone();
                let params = minion.message.header().coding_parameters;
                if let Some(sender) = self.senders.read().get(&dst).cloned() {
                    sender.on_ack(&session_id, params);
                }
                run_chain(self.pool.clone(), minion).await;
                continue;
            }

            let session_id = minion.message.header().session_id.clone();
            let decoder = self.decoder_for(&session_id);
            let produced = decoder.decode(&mut minion);

            // The loopback/test-coder ack suppression rule is retained
            // exactly as documented: this condition's dual purpose is an
            // open question, not something to "fix" here.
            let suppress_ack =
                self.coder_name != "test" && peer_addr.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST);
            if !suppress_ack {
                let ack = build_ack_datagram(minion.message.header(), decoder.encoded_parameters());
                let _ = self.socket.send_to(&ack, peer_addr).await;
            }

            if produced {
                tokio::spawn(run_chain(crossbar.clone(), minion));
            } else {
                run_chain(self.pool.clone(), minion).await;
            }
        }
    }
}

#[async_trait]
impl CrossbarConnectionManager for UdpTransport {
    async fn get_sender(&self, node_id: NodeId) -> Option<Arc<dyn Stop>> {
        UdpTransport::get_sender(self, node_id)
    }
}

/// UDP never dials out; there is nothing to "initiate". Every announced
/// peer immediately gets a logical sender over the one shared socket.
#[async_trait]
impl crate::net::ConnectionManager for UdpTransport {
    async fn create(self: Arc<Self>, hostname: String, node_id: NodeId) {
        // Every node in the cluster listens for UDP on the same configured
        // port, so the peer's datagram port is this node's own bound port.
        let local_port = self.socket.local_addr().map(|a| a.port()).unwrap_or(0);
        let addr: SocketAddr = match format!("{hostname}:{local_port}").parse() {
            Ok(a) => a,
            Err(e) => {
                error!(%hostname, error = %e, "cannot parse peer address for udp sender");
                return;
            }
        };
        self.create_sender(node_id, addr);
    }

    fn should_initiate_connection_to(&self, _node_id: NodeId) -> bool {
        true
    }

    fn remove(&self, node_id: NodeId) {
        UdpTransport::remove(self, node_id)
    }
}

//! Wires the minion pool, forwarding table, pending archive, crossbar,
//! connection manager, controller proxy, and pseudo apps together at
//! startup, and provides the one blocking entry point an embedding CLI
//! calls once everything is wired.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::apps::AppManager;
use crate::archive::PendingPacketArchive;
use crate::config::{Config, TransportChoice};
use crate::controller::ControllerProxy;
use crate::crossbar::{Crossbar, QueryForwardingEntry};
use crate::error::{Result, SiphonError};
use crate::forwarding::ForwardingTable;
use crate::minion::{MinionPool, Stop};
use crate::net::tcp::TcpConnectionManager;
use crate::net::udp::UdpTransport;
use crate::net::ConnectionManager as NetConnectionManager;
use crate::node_manager::NodeManager;
use crate::notify::NotificationBus;

const MINION_POOL_SIZE: usize = crate::minion::DEFAULT_POOL_SIZE;

/// Either concrete peer transport, erased down to the two trait views the
/// rest of the node needs: the crossbar's read-only sender lookup, and
/// the controller dispatch path's connect/remove mutations.
enum Transport {
    Tcp(Arc<TcpConnectionManager>),
    Udp(Arc<UdpTransport>),
}

impl Transport {
    fn as_crossbar_connections(&self) -> Arc<dyn crate::crossbar::ConnectionManager> {
        match self {
            Transport::Tcp(mgr) => mgr.clone(),
            Transport::Udp(t) => t.clone(),
        }
    }

    fn as_net_connections(&self) -> Arc<dyn NetConnectionManager> {
        match self {
            Transport::Tcp(mgr) => mgr.clone(),
            Transport::Udp(t) => t.clone(),
        }
    }
}

/// The assembled node. Holds the controller proxy because that's the one
/// component whose loss is fatal to the whole process (spec.md §7, kind
/// 5); everything else fails in isolation.
pub struct Aggregator {
    controller: Arc<ControllerProxy>,
}

impl Aggregator {
    /// Connects to the controller (learning this node's id from the
    /// handshake), then builds every other component in the order the
    /// original aggregator does: pool, app manager, node manager,
    /// transport, crossbar, then wires the controller's dispatch path and
    /// starts the pseudo apps.
    pub async fn start(config: Config, controller_host: &str, local_hostname: String) -> Result<Arc<Self>> {
        let controller = ControllerProxy::connect(controller_host, config.controller_port, local_hostname).await?;
        let local_node_id = controller.local_node_id();
        info!(local_node_id, "siphon node starting");

        let pool = MinionPool::new(MINION_POOL_SIZE, config.max_message_size as usize);
        let table = ForwardingTable::new();
        let archive = PendingPacketArchive::new();
        let app_manager = AppManager::new(pool.clone(), local_node_id);
        let node_manager = Arc::new(NodeManager::new());

        let transport = match &config.transport {
            TransportChoice::Tcp => {
                Transport::Tcp(TcpConnectionManager::new(local_node_id, pool.clone()))
            }
            TransportChoice::Udp(udp_cfg) => {
                let addr: SocketAddr = format!("0.0.0.0:{}", config.udp_listening_port)
                    .parse()
                    .map_err(|e| SiphonError::Fatal(format!("invalid udp bind address: {e}")))?;
                let transport = UdpTransport::bind(local_node_id, addr, pool.clone(), udp_cfg.coder_name.clone())
                    .await
                    .map_err(|e| SiphonError::Fatal(format!("failed to bind udp listening socket: {e}")))?;
                Transport::Udp(transport)
            }
        };

        let bus = NotificationBus::<QueryForwardingEntry>::new(controller.clone());
        let crossbar = Crossbar::new(
            local_node_id,
            table,
            archive,
            pool.clone() as Arc<dyn Stop>,
            app_manager.clone() as Arc<dyn Stop>,
            transport.as_crossbar_connections(),
            bus,
        );

        match &transport {
            Transport::Tcp(mgr) => {
                mgr.init(crossbar.clone());
                if !config.local_debug_no_receiving_socket {
                    let addr: SocketAddr = format!("0.0.0.0:{}", config.tcp_listening_port)
                        .parse()
                        .map_err(|e| SiphonError::Fatal(format!("invalid tcp bind address: {e}")))?;
                    mgr.listen(addr)
                        .await
                        .map_err(|e| SiphonError::Fatal(format!("failed to bind tcp listening socket: {e}")))?;
                }
            }
            Transport::Udp(transport) => transport.init(crossbar.clone()),
        }

        app_manager.create_pseudo_apps(crossbar.clone() as Arc<dyn Stop>, &config.pseudo_sessions);
        controller.setup(node_manager, crossbar, transport.as_net_connections());

        Ok(Arc::new(Aggregator { controller }))
    }

    /// Blocks until the controller connection is lost after a successful
    /// connect, the one failure spec.md treats as fatal to the process.
    pub async fn wait_until_error(&self) {
        self.controller.wait_fatal().await;
    }
}

/// Builds a dedicated multi-threaded runtime sized to hardware
/// concurrency (minimum one worker), starts the node on it, and blocks
/// the calling thread until a fatal error is detected. Mirrors the
/// original's `ThreadPool`: N threads all driving the same reactor,
/// kept alive until `waitUntilErrorDetected` returns.
pub fn run_blocking(config: Config, controller_host: String, local_hostname: String) -> Result<()> {
    let _log_guard = crate::logging::init(None);
    let worker_threads = num_cpus::get().max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .map_err(|e| SiphonError::Fatal(format!("failed to build tokio runtime: {e}")))?;

    runtime.block_on(async move {
        let aggregator = Aggregator::start(config, &controller_host, local_hostname).await?;
        aggregator.wait_until_error().await;
        Err(SiphonError::Fatal("controller connection lost".into()))
    })
}

//! Full path across two real TCP-connected nodes: a miss on node A
//! archives the minion and emits exactly one query, installing the route
//! drains the archive over the wire, and node B's crossbar resolves the
//! hop to itself and hands the minion to the registered sink.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use siphon::apps::AppManager;
use siphon::archive::PendingPacketArchive;
use siphon::config::{PseudoSessionConfig, PseudoSessionType};
use siphon::crossbar::{Crossbar, QueryForwardingEntry};
use siphon::forwarding::{parse_entry, ForwardingTable};
use siphon::minion::{Minion, MinionPool, Stop};
use siphon::net::tcp::TcpConnectionManager;
use siphon::notify::{NotificationBus, Observer};

struct CountingObserver {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Observer<QueryForwardingEntry> for CountingObserver {
    async fn handle(&self, _msg: QueryForwardingEntry) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

fn make_minion(session_id: &str, payload: &[u8]) -> Box<Minion> {
    let mut m = Minion::new(4096);
    m.message.header_mut().session_id = session_id.to_string();
    let len = payload.len();
    m.message.allocate_buffer().extend_from_slice(payload);
    m.message.reset_payload(true, (0, len));
    Box::new(m)
}

#[tokio::test]
async fn miss_then_routing_install_delivers_over_tcp_to_the_remote_sink() {
    const LOCAL: u32 = 3;
    const REMOTE: u32 = 4;

    let pool_a = MinionPool::new(8, 4096);
    let pool_b = MinionPool::new(8, 4096);
    let table_a = ForwardingTable::new();
    let table_b = ForwardingTable::new();
    let archive_a = PendingPacketArchive::new();
    let archive_b = PendingPacketArchive::new();

    // Node B already knows this session terminates locally.
    let self_entry = parse_entry("S", &json!([REMOTE])).unwrap();
    table_b.insert_entry("S".into(), self_entry, None).unwrap();

    let app_manager_b = AppManager::new(pool_b.clone(), REMOTE);
    app_manager_b.create_pseudo_apps(
        pool_b.clone() as Arc<dyn Stop>,
        &[PseudoSessionConfig {
            session_id: "S".into(),
            session_type: PseudoSessionType::Sink,
            src: LOCAL,
            dst: REMOTE,
            rate: 1.0,
            burst_size: 1,
            ori_data_path: None,
            message_size: None,
            payload_size: 11,
        }],
    );
    let sink = app_manager_b.sink_for("S").expect("sink registered for S");

    let mgr_a = TcpConnectionManager::new(LOCAL, pool_a.clone());
    let mgr_b = TcpConnectionManager::new(REMOTE, pool_b.clone());

    let query_count = Arc::new(AtomicUsize::new(0));
    let query_notify = Arc::new(Notify::new());
    let bus_a = NotificationBus::new(Arc::new(CountingObserver {
        count: query_count.clone(),
        notify: query_notify.clone(),
    }));
    let bus_b = NotificationBus::new(Arc::new(CountingObserver {
        count: Arc::new(AtomicUsize::new(0)),
        notify: Arc::new(Notify::new()),
    }));

    let crossbar_a = Crossbar::new(
        LOCAL,
        table_a.clone(),
        archive_a.clone(),
        pool_a.clone() as Arc<dyn Stop>,
        pool_a.clone() as Arc<dyn Stop>,
        mgr_a.clone(),
        bus_a,
    );
    let crossbar_b = Crossbar::new(
        REMOTE,
        table_b,
        archive_b,
        pool_b.clone() as Arc<dyn Stop>,
        app_manager_b as Arc<dyn Stop>,
        mgr_b.clone(),
        bus_b,
    );

    mgr_a.init(crossbar_a.clone());
    mgr_b.init(crossbar_b);

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let bound = listener.local_addr().unwrap();
    drop(listener);
    mgr_b.listen(bound).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    mgr_a.connect_to(bound, REMOTE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // First arrival misses: no route for "S" yet at A.
    crossbar_a.clone().process(make_minion("S", b"hello-there")).await;
    query_notify.notified().await;
    assert_eq!(query_count.load(Ordering::SeqCst), 1);
    assert!(archive_a.contains("S"));

    // The controller answers: installing the route drains the archive
    // over the wire to node B.
    let route = parse_entry("S", &json!([REMOTE])).unwrap();
    crossbar_a.install_forwarding_table_entry("S".into(), route, None);

    for _ in 0..50 {
        if sink.total_bytes() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.total_bytes(), 11);
    assert!(archive_a.is_empty_for("S"));
}

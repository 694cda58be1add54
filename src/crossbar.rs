//! The central routing stop: on every message, look up the forwarding
//! table, emit a query to the controller on miss, and flush archived
//! minions once the controller resolves a session.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::archive::PendingPacketArchive;
use crate::forwarding::{ForwardingTable, NodeId};
use crate::minion::{run_chain, Minion, Stop};
use crate::notify::NotificationBus;

/// Emitted exactly once per session on the first archived miss; the
/// controller proxy is the sole observer.
#[derive(Debug, Clone)]
pub struct QueryForwardingEntry {
    pub session_id: String,
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn get_sender(&self, node_id: NodeId) -> Option<Arc<dyn Stop>>;
}

pub struct Crossbar {
    local_node_id: NodeId,
    table: Arc<ForwardingTable>,
    archive: Arc<PendingPacketArchive>,
    pool: Arc<dyn Stop>,
    local_app: Arc<dyn Stop>,
    connections: Arc<dyn ConnectionManager>,
    queries: NotificationBus<QueryForwardingEntry>,
}

impl Crossbar {
    pub fn new(
        local_node_id: NodeId,
        table: Arc<ForwardingTable>,
        archive: Arc<PendingPacketArchive>,
        pool: Arc<dyn Stop>,
        local_app: Arc<dyn Stop>,
        connections: Arc<dyn ConnectionManager>,
        queries: NotificationBus<QueryForwardingEntry>,
    ) -> Arc<Self> {
        Arc::new(Crossbar {
            local_node_id,
            table,
            archive,
            pool,
            local_app,
            connections,
            queries,
        })
    }

    fn parent_session_id(session_id: &str) -> Option<&str> {
        session_id.find('@').map(|idx| &session_id[..idx])
    }

    /// Called by the controller-proxy dispatch path once a Routing
    /// message installs a fresh entry: drains whatever archived for
    /// `session_id`, installs the entry, then drops the archive entry.
    pub fn install_forwarding_table_entry(
        self: &Arc<Self>,
        session_id: String,
        entry: Arc<dyn crate::forwarding::ForwardingEntry>,
        ttl: Option<std::time::Duration>,
    ) {
        let hops = entry.next_hop();
        if let Some(drained) = self.archive.take_and_reset(&session_id) {
            for minion in drained {
                self.dispatch_to_hops(&hops, minion);
            }
        }
        if let Err(err) = self.table.insert_entry(session_id.clone(), entry, ttl) {
            warn!(session_id, %err, "failed to install forwarding table entry");
        }
        self.archive.remove_session(&session_id);
    }

    /// Multicast via Generic entries is accepted on ingest, but only the
    /// first next hop is ever dispatched (multicast is deprecated).
    fn dispatch_to_hops(self: &Arc<Self>, hops: &std::collections::HashSet<NodeId>, minion: Box<Minion>) {
        let Some(&hop) = hops.iter().next() else {
            warn!("forwarding entry resolved to zero next hops, dropping minion");
            tokio::spawn(run_chain(self.pool.clone(), minion));
            return;
        };
        self.dispatch_to_node(hop, minion);
    }

    fn dispatch_to_node(self: &Arc<Self>, hop: NodeId, minion: Box<Minion>) {
        if hop == self.local_node_id {
            tokio::spawn(run_chain(self.local_app.clone(), minion));
        } else {
            let connections = self.connections.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                match connections.get_sender(hop).await {
                    Some(sender) => run_chain(sender, minion).await,
                    None => {
                        warn!(node_id = hop, "no sender for next hop, dropping minion");
                        run_chain(pool, minion).await;
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Stop for Crossbar {
    async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        if minion.message.payload().is_empty() {
            return Some((self.pool.clone(), minion));
        }

        let session_id = minion.message.header().session_id.clone();
        let direct = self.table.get_next_hop(&session_id);
        let (hops, resolved) = match direct {
            Some(hops) => (Some(hops), true),
            None => match Self::parent_session_id(&session_id) {
                Some(parent) if parent != session_id => match self.table.get_next_hop(parent) {
                    Some(hops) => (Some(hops), true),
                    None => (None, false),
                },
                _ => (None, false),
            },
        };

        if !resolved {
            let is_new = self.archive.archive_minion(&session_id, minion);
            if is_new {
                self.queries.notify(QueryForwardingEntry {
                    session_id: session_id.clone(),
                });
            }
            return None;
        }

        let hops = hops.unwrap();
        if let Some(drained) = self.archive.take_and_reset(&session_id) {
            for archived in drained {
                self.dispatch_to_hops(&hops, archived);
            }
        }
        debug!(session_id, ?hops, "crossbar hit");

        let Some(&hop) = hops.iter().next() else {
            return Some((self.pool.clone(), minion));
        };
        if hop == self.local_node_id {
            Some((self.local_app.clone(), minion))
        } else {
            match self.connections.get_sender(hop).await {
                Some(sender) => Some((sender, minion)),
                None => {
                    warn!(node_id = hop, "no sender for next hop, dropping minion");
                    Some((self.pool.clone(), minion))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::parse_entry;
    use crate::minion::MinionPool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct RecordingAppSink {
        received: Arc<Mutex<Vec<String>>>,
        pool: Arc<dyn Stop>,
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl Stop for RecordingAppSink {
        async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
            self.received
                .lock()
                .unwrap()
                .push(minion.message.header().session_id.clone());
            self.notify.notify_one();
            Some((self.pool.clone(), minion))
        }
    }

    struct NoOpConnections;
    #[async_trait]
    impl ConnectionManager for NoOpConnections {
        async fn get_sender(&self, _node_id: NodeId) -> Option<Arc<dyn Stop>> {
            None
        }
    }

    struct CountingObserver {
        count: Arc<AtomicUsize>,
        notify: Arc<Notify>,
    }
    #[async_trait]
    impl crate::notify::Observer<QueryForwardingEntry> for CountingObserver {
        async fn handle(&self, _msg: QueryForwardingEntry) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    fn make_minion(session_id: &str) -> Box<Minion> {
        let mut m = Minion::new(1024);
        m.message.header_mut().session_id = session_id.to_string();
        let buf = m.message.allocate_buffer();
        buf.extend_from_slice(b"payload");
        m.message.reset_payload(true, (0, 7));
        Box::new(m)
    }

    #[tokio::test]
    async fn pending_drain_dispatches_in_arrival_order_and_queries_once() {
        let pool = MinionPool::new(16, 1024);
        let table = ForwardingTable::new();
        let archive = PendingPacketArchive::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_notify = Arc::new(Notify::new());
        let sink: Arc<dyn Stop> = Arc::new(RecordingAppSink {
            received: received.clone(),
            pool: pool.clone() as Arc<dyn Stop>,
            notify: sink_notify.clone(),
        });
        let query_count = Arc::new(AtomicUsize::new(0));
        let query_notify = Arc::new(Notify::new());
        let bus = NotificationBus::new(Arc::new(CountingObserver {
            count: query_count.clone(),
            notify: query_notify.clone(),
        }));

        let crossbar = Crossbar::new(
            1,
            table.clone(),
            archive.clone(),
            pool.clone() as Arc<dyn Stop>,
            sink,
            Arc::new(NoOpConnections),
            bus,
        );

        for _ in 0..5 {
            let minion = make_minion("X");
            crossbar.clone().process(minion).await;
        }
        query_notify.notified().await;
        assert_eq!(query_count.load(Ordering::SeqCst), 1);
        assert!(archive.contains("X"));

        let entry = parse_entry("X", &json!([1])).unwrap();
        crossbar.install_forwarding_table_entry("X".to_string(), entry, None);

        for _ in 0..5 {
            sink_notify.notified().await;
        }
        assert_eq!(received.lock().unwrap().len(), 5);
        assert!(archive.is_empty_for("X"));
        assert_eq!(table.get_next_hop("X").unwrap(), std::collections::HashSet::from([1]));
    }

    #[tokio::test]
    async fn null_payload_is_dropped_straight_to_the_pool() {
        let pool = MinionPool::new(4, 1024);
        let table = ForwardingTable::new();
        let archive = PendingPacketArchive::new();
        let sink: Arc<dyn Stop> = pool.clone() as Arc<dyn Stop>;
        let query_count = Arc::new(AtomicUsize::new(0));
        let bus = NotificationBus::new(Arc::new(CountingObserver {
            count: query_count.clone(),
            notify: Arc::new(Notify::new()),
        }));
        let crossbar = Crossbar::new(1, table, archive, pool.clone() as Arc<dyn Stop>, sink, Arc::new(NoOpConnections), bus);

        let minion = Box::new(Minion::new(1024)); // empty payload
        let before = pool.waiting();
        let result = crossbar.process(minion).await;
        assert!(matches!(result, Some((_, _))));
        assert_eq!(pool.waiting(), before); // handed to pool.process(), not consumed yet by test
    }
}

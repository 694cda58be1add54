//! Degenerate pipeline endpoints: the pseudo source and sink test
//! applications, and the manager that creates them from configured
//! pseudo sessions and dispatches locally-destined minions to the right
//! sink by session id.

pub mod sink;
pub mod source;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::{PseudoSessionConfig, PseudoSessionType};
use crate::forwarding::NodeId;
use crate::minion::{Minion, MinionPool, Stop};
use sink::PseudoAppSink;
use source::PseudoAppSource;

/// The stop the crossbar hands a minion to when its next hop resolves to
/// the local node. Holds every sink keyed by session id; sources are
/// driven by their own token-bucket timers and aren't looked up here.
pub struct AppManager {
    pool: Arc<MinionPool>,
    local_node_id: NodeId,
    sources: RwLock<HashMap<String, Arc<PseudoAppSource>>>,
    sinks: RwLock<HashMap<String, Arc<PseudoAppSink>>>,
}

impl AppManager {
    pub fn new(pool: Arc<MinionPool>, local_node_id: NodeId) -> Arc<Self> {
        Arc::new(AppManager {
            pool,
            local_node_id,
            sources: RwLock::new(HashMap::new()),
            sinks: RwLock::new(HashMap::new()),
        })
    }

    /// Builds and starts a source for every configured session whose `src`
    /// is this node, and registers a sink for every session whose `dst` is
    /// this node. `crossbar` is the source's next stop.
    pub fn create_pseudo_apps(self: &Arc<Self>, crossbar: Arc<dyn Stop>, sessions: &[PseudoSessionConfig]) {
        let mut sources = self.sources.write();
        let mut sinks = self.sinks.write();
        for session in sessions {
            if session.session_type == PseudoSessionType::Source && session.src == self.local_node_id {
                let source = PseudoAppSource::new(self.pool.clone(), crossbar.clone(), session);
                source.start();
                sources.insert(session.session_id.clone(), source);
            }
            if session.session_type == PseudoSessionType::Sink && session.dst == self.local_node_id {
                let sink = PseudoAppSink::new(self.pool.clone(), session.session_id.clone());
                sinks.insert(session.session_id.clone(), sink);
            }
        }
    }

    pub fn sink_for(&self, session_id: &str) -> Option<Arc<PseudoAppSink>> {
        self.sinks.read().get(session_id).cloned()
    }
}

#[async_trait]
impl Stop for AppManager {
    async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        let session_id = minion.message.header().session_id.clone();
        match self.sink_for(&session_id) {
            Some(sink) => Some((sink as Arc<dyn Stop>, minion)),
            None => {
                warn!(session_id, "no sink registered for this session, dropping");
                Some((self.pool.clone() as Arc<dyn Stop>, minion))
            }
        }
    }
}

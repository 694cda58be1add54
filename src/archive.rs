//! Per-session queue holding minions blocked on a forwarding-table miss
//! until the controller answers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::minion::Minion;

type SessionQueue = Mutex<Option<VecDeque<Box<Minion>>>>;

pub struct PendingPacketArchive {
    map: RwLock<HashMap<String, Arc<SessionQueue>>>,
}

impl PendingPacketArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingPacketArchive {
            map: RwLock::new(HashMap::new()),
        })
    }

    fn holder_for(&self, session_id: &str) -> Arc<SessionQueue> {
        if let Some(h) = self.map.read().get(session_id) {
            return h.clone();
        }
        self.map
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Appends `minion` to the session's queue, creating it if absent.
    /// Returns true only when this archival is the first since the
    /// session's queue was last created or reset — the caller uses this
    /// to emit exactly one `QueryForwardingEntry` per outstanding miss.
    pub fn archive_minion(&self, session_id: &str, minion: Box<Minion>) -> bool {
        let holder = self.holder_for(session_id);
        let mut guard = holder.lock();
        let is_new = guard.is_none();
        if is_new {
            *guard = Some(VecDeque::new());
        }
        guard.as_mut().unwrap().push_back(minion);
        is_new
    }

    /// Atomically swaps the session's queue pointer to empty, leaving the
    /// map entry (and thus the session's archival history) in place, and
    /// returns whatever was queued, in FIFO arrival order.
    pub fn take_and_reset(&self, session_id: &str) -> Option<VecDeque<Box<Minion>>> {
        let holder = self.map.read().get(session_id).cloned()?;
        holder.lock().take()
    }

    /// Erases the session entirely, as opposed to [`Self::take_and_reset`]
    /// which preserves the map entry.
    pub fn remove_session(&self, session_id: &str) {
        self.map.write().remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.map.read().contains_key(session_id)
    }

    pub fn is_empty_for(&self, session_id: &str) -> bool {
        match self.map.read().get(session_id) {
            None => true,
            Some(h) => h.lock().as_ref().map(|q| q.is_empty()).unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_archival_reports_new_subsequent_do_not() {
        let archive = PendingPacketArchive::new();
        assert!(archive.archive_minion("X", Box::new(Minion::new(1024))));
        assert!(!archive.archive_minion("X", Box::new(Minion::new(1024))));
    }

    #[test]
    fn take_and_reset_preserves_entry_but_empties_queue() {
        let archive = PendingPacketArchive::new();
        archive.archive_minion("X", Box::new(Minion::new(1024)));
        archive.archive_minion("X", Box::new(Minion::new(1024)));
        let drained = archive.take_and_reset("X").unwrap();
        assert_eq!(drained.len(), 2);
        assert!(archive.contains("X"));
        assert!(archive.is_empty_for("X"));
        // A fresh miss after reset is treated as new again.
        assert!(archive.archive_minion("X", Box::new(Minion::new(1024))));
    }

    #[test]
    fn remove_session_erases_the_map_entry() {
        let archive = PendingPacketArchive::new();
        archive.archive_minion("X", Box::new(Minion::new(1024)));
        archive.remove_session("X");
        assert!(!archive.contains("X"));
    }
}

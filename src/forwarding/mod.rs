//! Concurrent session -> next-hop map with three entry shapes and
//! optional sliding TTL. Reads dominate; writes only ever come from the
//! controller-proxy dispatch path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::Value;

use crate::error::{Result, SiphonError};

pub const MAX_FORWARDING_TABLE_SIZE: usize = 256;

pub type NodeId = u32;

pub trait ForwardingEntry: Send + Sync {
    fn next_hop(&self) -> HashSet<NodeId>;
}

/// Unweighted set of next hops.
pub struct SimpleEntry {
    hops: HashSet<NodeId>,
}

impl ForwardingEntry for SimpleEntry {
    fn next_hop(&self) -> HashSet<NodeId> {
        self.hops.clone()
    }
}

/// Weighted multimap resolved by a single random draw on lookup.
pub struct SplitterEntry {
    /// Sorted descending by weight, as the original's `multimap<double,
    /// nodeID_t, greater<double>>` iterates.
    weighted: Vec<(f64, NodeId)>,
    total_weight: f64,
}

impl SplitterEntry {
    fn parse(arr: &[Value]) -> Result<Self> {
        let mut weighted = Vec::with_capacity(arr.len());
        let mut total_weight = 0.0;
        for item in arr {
            let next_hop = item
                .get("NextHop")
                .and_then(Value::as_u64)
                .ok_or_else(|| SiphonError::ForwardingEntryDecode {
                    session_id: String::new(),
                    reason: "Splitter entry missing integer NextHop".into(),
                })? as NodeId;
            let weight = item
                .get("Weight")
                .and_then(Value::as_f64)
                .ok_or_else(|| SiphonError::ForwardingEntryDecode {
                    session_id: String::new(),
                    reason: "Splitter entry missing numeric Weight".into(),
                })?;
            if weight <= 0.0 {
                return Err(SiphonError::ForwardingEntryDecode {
                    session_id: String::new(),
                    reason: "Splitter entry weight must be > 0".into(),
                });
            }
            total_weight += weight;
            weighted.push((weight, next_hop));
        }
        if weighted.is_empty() {
            return Err(SiphonError::ForwardingEntryDecode {
                session_id: String::new(),
                reason: "Splitter entry has no next hops".into(),
            });
        }
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        Ok(SplitterEntry {
            weighted,
            total_weight,
        })
    }

    fn draw(&self) -> NodeId {
        let mut r = rand::thread_rng().gen::<f64>() * self.total_weight;
        for &(weight, hop) in &self.weighted {
            if r < weight {
                return hop;
            }
            r -= weight;
        }
        // Floating point rounding at the tail: fall back to the smallest-weight hop.
        self.weighted.last().unwrap().1
    }
}

impl ForwardingEntry for SplitterEntry {
    fn next_hop(&self) -> HashSet<NodeId> {
        let mut set = HashSet::with_capacity(1);
        set.insert(self.draw());
        set
    }
}

/// Array of arrays; each sub-array is an independent weighted draw
/// (multicast-per-replica). The crossbar dispatches only the first
/// next-hop from this union (multicast is deprecated; see the spec's
/// Open Questions) but the table itself still computes the full union.
pub struct GenericEntry {
    replicas: Vec<SplitterEntry>,
}

impl GenericEntry {
    fn parse(arr: &[Value]) -> Result<Self> {
        let mut replicas = Vec::with_capacity(arr.len());
        for sub in arr {
            let sub_arr = sub.as_array().ok_or_else(|| SiphonError::ForwardingEntryDecode {
                session_id: String::new(),
                reason: "Generic entry replica must be an array".into(),
            })?;
            replicas.push(SplitterEntry::parse(sub_arr)?);
        }
        if replicas.is_empty() {
            return Err(SiphonError::ForwardingEntryDecode {
                session_id: String::new(),
                reason: "Generic entry has no replicas".into(),
            });
        }
        Ok(GenericEntry { replicas })
    }
}

impl ForwardingEntry for GenericEntry {
    fn next_hop(&self) -> HashSet<NodeId> {
        self.replicas.iter().map(|r| r.draw()).collect()
    }
}

/// Dispatches on message shape: a flat number array is Simple, an array
/// of `{NextHop, Weight}` objects is Splitter, an array of arrays is
/// Generic.
pub fn parse_entry(session_id: &str, value: &Value) -> Result<Arc<dyn ForwardingEntry>> {
    let arr = value.as_array().ok_or_else(|| SiphonError::ForwardingEntryDecode {
        session_id: session_id.to_string(),
        reason: "Entry must be a JSON array".into(),
    })?;
    if arr.is_empty() {
        return Err(SiphonError::ForwardingEntryDecode {
            session_id: session_id.to_string(),
            reason: "Entry array is empty".into(),
        });
    }
    let tag_err = |reason: &str| SiphonError::ForwardingEntryDecode {
        session_id: session_id.to_string(),
        reason: reason.to_string(),
    };
    if arr.iter().all(Value::is_u64) {
        let hops = arr.iter().map(|v| v.as_u64().unwrap() as NodeId).collect();
        Ok(Arc::new(SimpleEntry { hops }))
    } else if arr.iter().all(Value::is_object) {
        SplitterEntry::parse(arr)
            .map(|e| Arc::new(e) as Arc<dyn ForwardingEntry>)
            .map_err(|e| retag(e, session_id))
    } else if arr.iter().all(Value::is_array) {
        GenericEntry::parse(arr)
            .map(|e| Arc::new(e) as Arc<dyn ForwardingEntry>)
            .map_err(|e| retag(e, session_id))
    } else {
        Err(tag_err("Entry array mixes shapes; expected all-integer, all-object, or all-array"))
    }
}

fn retag(err: SiphonError, session_id: &str) -> SiphonError {
    match err {
        SiphonError::ForwardingEntryDecode { reason, .. } => SiphonError::ForwardingEntryDecode {
            session_id: session_id.to_string(),
            reason,
        },
        other => other,
    }
}

struct EntryHolder {
    entry: Mutex<Arc<dyn ForwardingEntry>>,
    ttl: Mutex<Option<Duration>>,
    generation: AtomicU64,
}

pub struct ForwardingTable {
    entries: RwLock<HashMap<String, Arc<EntryHolder>>>,
}

impl ForwardingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(ForwardingTable {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Installs (or atomically replaces) the entry for `session_id`. The
    /// holder itself is found under a shared lock; only a genuinely new
    /// session takes the exclusive lock to insert the map entry, so
    /// concurrent readers of other sessions are never blocked by a write.
    /// A re-install's `ttl` replaces the holder's TTL outright (sliding
    /// back to permanent if `None`), per the "replaced atomically on
    /// re-install" rule for the entry's TTL attribute.
    pub fn insert_entry(
        self: &Arc<Self>,
        session_id: String,
        entry: Arc<dyn ForwardingEntry>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let existing = { self.entries.read().get(&session_id).cloned() };
        let holder = match existing {
            Some(h) => {
                *h.entry.lock() = entry;
                *h.ttl.lock() = ttl;
                h
            }
            None => {
                let mut w = self.entries.write();
                if !w.contains_key(&session_id) && w.len() >= MAX_FORWARDING_TABLE_SIZE {
                    return Err(SiphonError::ForwardingEntryDecode {
                        session_id: session_id.clone(),
                        reason: format!("forwarding table is full ({MAX_FORWARDING_TABLE_SIZE} sessions)"),
                    });
                }
                let new_holder = Arc::new(EntryHolder {
                    entry: Mutex::new(entry),
                    ttl: Mutex::new(ttl),
                    generation: AtomicU64::new(0),
                });
                w.entry(session_id.clone()).or_insert(new_holder).clone()
            }
        };
        // Bumping the generation here invalidates any timer armed under the
        // old TTL even when the new TTL is `None`, so a re-install that
        // drops the TTL actually cancels the pending expiry instead of
        // leaving the stale timer to remove the entry out from under it.
        if let Some(dur) = ttl {
            self.arm_timer(session_id, holder, dur);
        } else {
            holder.generation.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, session_id: String, holder: Arc<EntryHolder>, dur: Duration) {
        let generation = holder.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let table = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            table.expire_if_current(&session_id, &holder, generation);
        });
    }

    fn expire_if_current(&self, session_id: &str, holder: &Arc<EntryHolder>, generation: u64) {
        if holder.generation.load(Ordering::Acquire) != generation {
            return; // a later lookup or re-install rearmed the timer
        }
        let mut w = self.entries.write();
        if let Some(current) = w.get(session_id) {
            if Arc::ptr_eq(current, holder) {
                w.remove(session_id);
            }
        }
    }

    /// Returns the resolved next hops for `session_id`, sliding the TTL
    /// forward on every hit.
    pub fn get_next_hop(self: &Arc<Self>, session_id: &str) -> Option<HashSet<NodeId>> {
        let holder = { self.entries.read().get(session_id).cloned() }?;
        let hops = holder.entry.lock().next_hop();
        let ttl = *holder.ttl.lock();
        if let Some(dur) = ttl {
            self.arm_timer(session_id.to_string(), holder, dur);
        }
        Some(hops)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.read().contains_key(session_id)
    }

    pub fn delete_entry(&self, session_id: &str) {
        self.entries.write().remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! A pseudo application data sink: accumulates received payload bytes for
//! one session and logs a throughput report every 5 seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::minion::{Minion, MinionPool, Stop};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

pub struct PseudoAppSink {
    pool: Arc<MinionPool>,
    session_id: String,
    counter: AtomicU64,
    last_report: Mutex<Instant>,
}

impl PseudoAppSink {
    pub fn new(pool: Arc<MinionPool>, session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(PseudoAppSink {
            pool,
            session_id: session_id.into(),
            counter: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Bytes received since the last periodic report (or since creation,
    /// if none has fired yet).
    pub fn total_bytes(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    fn maybe_report(&self) {
        let now = Instant::now();
        let mut last = self.last_report.lock();
        let elapsed = now.duration_since(*last);
        if elapsed >= REPORT_INTERVAL {
            let bytes = self.counter.swap(0, Ordering::AcqRel);
            let rate = bytes as f64 / elapsed.as_secs_f64();
            info!(session_id = %self.session_id, rate_bps = rate, "receiving");
            *last = now;
        }
    }
}

#[async_trait]
impl Stop for PseudoAppSink {
    async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        self.counter
            .fetch_add(minion.message.header().payload_size as u64, Ordering::AcqRel);
        self.maybe_report();
        Some((self.pool.clone() as Arc<dyn Stop>, minion))
    }
}

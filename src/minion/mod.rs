//! Minions are batons carrying one [`Message`] down a pipeline of "stops".
//! The pool doubles as the free list and as a bounded single-consumer
//! rendezvous queue between minions and the stops requesting one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;

use crate::message::Message;

pub const DEFAULT_POOL_SIZE: usize = 256;

pub struct Minion {
    pub message: Message,
    pub extra_messages: Vec<Message>,
}

impl Minion {
    pub fn new(max_message_size: usize) -> Self {
        Minion {
            message: Message::new(max_message_size),
            extra_messages: Vec::new(),
        }
    }
}

/// A component implementing the `process(minion) -> next_stop` contract.
/// `process` must run to completion without parking the task on anything
/// but genuine I/O (socket read/write, timer, serialization-context
/// barrier) — those points are exactly where this `async fn` is allowed
/// to `.await`.
#[async_trait]
pub trait Stop: Send + Sync {
    async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)>;
}

/// Walks the minion down the chain until a stop returns `None` ("park
/// here"). Restarting a parked minion (a stop's own `wakeup`) is just
/// spawning this function again with the next stop.
pub async fn run_chain(stop: Arc<dyn Stop>, minion: Box<Minion>) {
    let mut next = Some((stop, minion));
    while let Some((stop, minion)) = next {
        next = stop.process(minion).await;
    }
}

/// Bounded pool of pre-allocated minions, also serving as the
/// minion<->requester rendezvous queue described in the component design:
/// a signed counter plus two bounded lock-free queues. `counter > 0` means
/// that many minions are queued with no requester; `counter < 0` means
/// that many requesters are queued with no minion; `counter == 0` means
/// both are empty.
pub struct MinionPool {
    counter: AtomicI64,
    minions: ArrayQueue<Box<Minion>>,
    requesters: ArrayQueue<Arc<dyn Stop>>,
}

impl MinionPool {
    pub fn new(size: usize, max_message_size: usize) -> Arc<Self> {
        let minions = ArrayQueue::new(size);
        for _ in 0..size {
            minions
                .push(Box::new(Minion::new(max_message_size)))
                .unwrap_or_else(|_| unreachable!("capacity matches preallocation count"));
        }
        Arc::new(MinionPool {
            counter: AtomicI64::new(size as i64),
            minions,
            requesters: ArrayQueue::new(size),
        })
    }

    fn spin_pop_minion(&self) -> Box<Minion> {
        loop {
            if let Some(m) = self.minions.pop() {
                return m;
            }
            std::hint::spin_loop();
        }
    }

    fn spin_pop_requester(&self) -> Arc<dyn Stop> {
        loop {
            if let Some(r) = self.requesters.pop() {
                return r;
            }
            std::hint::spin_loop();
        }
    }

    /// A stop that wants a minion to carry fresh work (e.g. a receiver
    /// about to park on a socket read) calls this. It either gets woken
    /// immediately with a free minion, or is parked until one is
    /// returned to the pool.
    pub fn request(self: &Arc<Self>, requester: Arc<dyn Stop>) {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        if previous > 0 {
            let minion = self.spin_pop_minion();
            tokio::spawn(run_chain(requester, minion));
        } else {
            self.requesters
                .push(requester)
                .unwrap_or_else(|_| panic!("minion pool overflow: requester queue full"));
        }
    }

    /// Synchronous convenience for pool construction / tests: blocks the
    /// current thread spinning until a minion is free rather than parking
    /// the caller as a stop. Not used on the hot path.
    pub fn take_blocking(self: &Arc<Self>) -> Box<Minion> {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        if previous > 0 {
            self.spin_pop_minion()
        } else {
            self.counter.fetch_add(1, Ordering::AcqRel);
            panic!("take_blocking called with no minions available");
        }
    }

    pub fn waiting(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Awaits a minion directly rather than resuming a named chain —
    /// for callers (receiver loops, app sources) that just want the next
    /// free minion, not a continuation handed to some other stop.
    pub async fn acquire(self: &Arc<Self>) -> Box<Minion> {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        if previous > 0 {
            self.spin_pop_minion()
        } else {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let requester: Arc<dyn Stop> = Arc::new(OneshotRequester {
                tx: parking_lot::Mutex::new(Some(tx)),
            });
            self.requesters
                .push(requester)
                .unwrap_or_else(|_| panic!("minion pool overflow: requester queue full"));
            rx.await.expect("pool dropped before fulfilling acquire()")
        }
    }
}

struct OneshotRequester {
    tx: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<Box<Minion>>>>,
}

#[async_trait]
impl Stop for OneshotRequester {
    async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(minion);
        }
        None
    }
}

#[async_trait]
impl Stop for MinionPool {
    /// Recycles the minion and either hands it straight to a parked
    /// requester or returns it to the free queue.
    async fn process(self: Arc<Self>, mut minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
        minion.message.recycle();
        minion.extra_messages.clear();
        let previous = self.counter.fetch_add(1, Ordering::AcqRel);
        if previous < 0 {
            let requester = self.spin_pop_requester();
            Some((requester, minion))
        } else {
            self.minions
                .push(minion)
                .unwrap_or_else(|_| panic!("minion pool overflow: minion queue full"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct RecordingStop {
        seen: Arc<AtomicUsize>,
        done: Arc<Notify>,
    }

    #[async_trait]
    impl Stop for RecordingStop {
        async fn process(self: Arc<Self>, minion: Box<Minion>) -> Option<(Arc<dyn Stop>, Box<Minion>)> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
            let _ = minion;
            None
        }
    }

    #[tokio::test]
    async fn counter_reflects_queued_minions_minus_queued_requesters() {
        let pool = MinionPool::new(4, 1024);
        assert_eq!(pool.waiting(), 4);

        let m = pool.take_blocking();
        assert_eq!(pool.waiting(), 3);

        pool.clone().process(m).await;
        assert_eq!(pool.waiting(), 4);
    }

    #[tokio::test]
    async fn requester_parked_when_pool_empty_is_woken_on_return() {
        let pool = MinionPool::new(1, 1024);
        let m = pool.take_blocking();
        assert_eq!(pool.waiting(), 0);

        let seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        let requester: Arc<dyn Stop> = Arc::new(RecordingStop {
            seen: seen.clone(),
            done: done.clone(),
        });
        pool.request(requester);
        assert_eq!(pool.waiting(), -1);

        pool.clone().process(m).await;
        done.notified().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn n_requesters_over_capacity_exactly_k_park() {
        let pool = MinionPool::new(2, 1024);
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::new(Notify::new());
            let requester: Arc<dyn Stop> = Arc::new(RecordingStop {
                seen: seen.clone(),
                done,
            });
            pool.request(requester);
        }
        // 2 minions immediately available, 3 requesters parked -> counter = -3
        assert_eq!(pool.waiting(), -3);
        tokio::task::yield_now().await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}

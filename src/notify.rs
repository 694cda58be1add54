//! Typed publish/subscribe bus. Each emitted message type maps to exactly
//! one observer, wired once at startup. Delivery is always posted to a
//! background task rather than invoked inline, so an emitter never
//! blocks on its observer's handler; an observer backed by this bus is
//! automatically "serialized" — its handler runs in a single task, so
//! messages from many producer threads still observe one total order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait Observer<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, msg: T);
}

pub struct NotificationBus<T: Send + 'static> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> NotificationBus<T> {
    pub fn new<O: Observer<T>>(observer: Arc<O>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                observer.handle(msg).await;
            }
        });
        NotificationBus { tx }
    }

    pub fn notify(&self, msg: T) {
        // A send error means the observer task has already shut down;
        // there is nothing useful to do with a dropped notification here.
        let _ = self.tx.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct CountingObserver {
        count: Arc<AtomicUsize>,
        done: Arc<Notify>,
    }

    #[async_trait]
    impl Observer<u32> for CountingObserver {
        async fn handle(&self, msg: u32) {
            self.count.fetch_add(msg as usize, Ordering::SeqCst);
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_order_to_a_single_observer() {
        let count = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        let bus = NotificationBus::new(Arc::new(CountingObserver {
            count: count.clone(),
            done: done.clone(),
        }));
        bus.notify(1);
        bus.notify(2);
        bus.notify(3);
        done.notified().await;
        done.notified().await;
        done.notified().await;
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }
}

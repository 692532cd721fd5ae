//! Update Multiplexer
//!
//! Fans every appended WAL record out to the observers whose filter
//! matches it. Each observer owns a bounded buffer drained by its own
//! delivery task, so a stalled observer only ever loses its own oldest
//! events and never slows producers down.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::filters::{NamespaceFilter, SubscriptionMode};
use super::observer::{ConnectionStatus, ObserverStats, UpdateEvent, UpdatesObserver};
use crate::wal::WalRecord;

type ObserverKey = usize;

fn observer_key<O: ?Sized>(observer: &Arc<O>) -> ObserverKey {
    Arc::as_ptr(observer) as *const () as usize
}

struct DeliveryQueue {
    events: VecDeque<UpdateEvent>,
    capacity: usize,
    delivered: u64,
    dropped: u64,
}

impl DeliveryQueue {
    fn push(&mut self, event: UpdateEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }
}

struct Subscriber {
    observer: Weak<dyn UpdatesObserver>,
    filter: RwLock<NamespaceFilter>,
    queue: Mutex<DeliveryQueue>,
    notify: Notify,
    /// Held while a callback runs; cleared by unsubscribe
    active: Mutex<bool>,
    cancel: CancellationToken,
}

impl Subscriber {
    fn enqueue(&self, event: UpdateEvent) {
        self.queue.lock().push(event);
        self.notify.notify_one();
    }

    fn is_alive(&self) -> bool {
        self.observer.strong_count() > 0
    }

    /// Run one callback. Returns false once the subscriber is finished.
    fn deliver(&self, event: &UpdateEvent) -> bool {
        let active = self.active.lock();
        if !*active {
            return false;
        }
        let observer = match self.observer.upgrade() {
            Some(observer) => observer,
            None => return false,
        };
        match event {
            UpdateEvent::Record(record) => observer.on_update(record),
            UpdateEvent::Connection(status) => observer.on_connection_state(status),
        }
        drop(active);
        self.queue.lock().delivered += 1;
        true
    }

    /// Deliver queued events in order until the queue is empty.
    /// Returns false once the subscriber is finished.
    fn drain(&self) -> bool {
        while !self.cancel.is_cancelled() {
            let event = self.queue.lock().events.pop_front();
            let Some(event) = event else { return true };
            if !self.deliver(&event) {
                return false;
            }
        }
        false
    }

    fn stats(&self) -> ObserverStats {
        let queue = self.queue.lock();
        ObserverStats {
            delivered: queue.delivered,
            dropped: queue.dropped,
            queued: queue.events.len(),
        }
    }
}

async fn run_delivery(subscriber: Arc<Subscriber>) {
    loop {
        tokio::select! {
            _ = subscriber.cancel.cancelled() => break,
            _ = subscriber.notify.notified() => {}
        }

        // Callbacks run on the blocking pool, never on a runtime worker
        let draining = Arc::clone(&subscriber);
        match tokio::task::spawn_blocking(move || draining.drain()).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Observer delivery stopped: {}", e);
                return;
            }
        }
    }
}

/// Registry of observers and their filters
pub struct UpdatesMultiplexer {
    subscribers: RwLock<HashMap<ObserverKey, Arc<Subscriber>>>,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl UpdatesMultiplexer {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an observer or change its filter.
    ///
    /// The registry keeps only a weak handle; the caller owns the observer.
    /// Must be called from within a tokio runtime.
    pub fn subscribe<I, S>(&self, observer: Arc<dyn UpdatesObserver>, namespaces: I, mode: SubscriptionMode)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = NamespaceFilter::from_names(namespaces);
        let key = observer_key(&observer);
        let mut subscribers = self.subscribers.write();

        if let Some(existing) = subscribers.get(&key) {
            if existing.is_alive() && !existing.cancel.is_cancelled() {
                existing.filter.write().apply(filter, mode);
                tracing::debug!("Observer {:#x} filter updated ({:?})", key, mode);
                return;
            }
        }

        let subscriber = Arc::new(Subscriber {
            observer: Arc::downgrade(&observer),
            filter: RwLock::new(filter),
            queue: Mutex::new(DeliveryQueue {
                events: VecDeque::new(),
                capacity: self.buffer_size,
                delivered: 0,
                dropped: 0,
            }),
            notify: Notify::new(),
            active: Mutex::new(true),
            cancel: self.shutdown.child_token(),
        });
        tokio::spawn(run_delivery(Arc::clone(&subscriber)));
        if let Some(stale) = subscribers.insert(key, subscriber) {
            stale.cancel.cancel();
        }
        tracing::debug!("Observer {:#x} subscribed", key);
    }

    /// Remove an observer. No callback for it starts after this returns.
    pub fn unsubscribe<O: ?Sized>(&self, observer: &Arc<O>) -> bool {
        let key = observer_key(observer);
        let removed = self.subscribers.write().remove(&key);
        match removed {
            Some(subscriber) => {
                *subscriber.active.lock() = false;
                subscriber.cancel.cancel();
                tracing::debug!("Observer {:#x} unsubscribed", key);
                true
            }
            None => false,
        }
    }

    /// Dispatch an appended record to matching observers
    pub fn on_append(&self, record: &Arc<WalRecord>) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (key, subscriber) in subscribers.iter() {
                if !subscriber.is_alive() {
                    dead.push(*key);
                    continue;
                }
                if subscriber.filter.read().matches(record) {
                    subscriber.enqueue(UpdateEvent::Record(Arc::clone(record)));
                }
            }
        }
        self.prune(dead);
    }

    /// Tell every observer about a replication connectivity change
    pub fn notify_connection_state(&self, status: &ConnectionStatus) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.values() {
            subscriber.enqueue(UpdateEvent::Connection(status.clone()));
        }
    }

    fn prune(&self, dead: Vec<ObserverKey>) {
        if dead.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        for key in dead {
            if let Some(subscriber) = subscribers.remove(&key) {
                subscriber.cancel.cancel();
                tracing::debug!("Observer {:#x} dropped by its owner, removed", key);
            }
        }
    }

    pub fn stats<O: ?Sized>(&self, observer: &Arc<O>) -> Option<ObserverStats> {
        self.subscribers
            .read()
            .get(&observer_key(observer))
            .map(|s| s.stats())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Stop all delivery tasks
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut subscribers = self.subscribers.write();
        for subscriber in subscribers.values() {
            *subscriber.active.lock() = false;
        }
        subscribers.clear();
    }
}

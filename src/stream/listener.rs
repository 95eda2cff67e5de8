//! Listeners - one bounded delivery queue per subscriber
//!
//! A publisher never waits on a listener. When a queue is full the
//! listener's [`DropPolicy`] decides what gives way.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::constants::DEFAULT_LISTENER_CAPACITY;

use super::event::Event;

/// What happens to an event offered to a full queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DropPolicy {
    /// Discard the incoming event
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Disconnect the slow subscriber
    DropListener,
}

/// Queue size and backpressure policy for a new subscription
#[derive(Clone, Copy, Debug)]
pub struct SubscribeOptions {
    pub capacity: usize,
    pub policy: DropPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            capacity: DEFAULT_LISTENER_CAPACITY,
            policy: DropPolicy::default(),
        }
    }
}

impl SubscribeOptions {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        SubscribeOptions { capacity, policy }
    }
}

/// Outcome of offering one event to a listener
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Offer {
    Delivered,
    /// An event was lost (either the new one or an evicted one)
    Dropped,
    /// The queue was full and the listener got disconnected
    Disconnected,
    /// Listener already dead, nothing offered
    Skipped,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Event>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct Listener {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
    policy: DropPolicy,
    dead: AtomicBool,
    dropped: AtomicU64,
}

impl Listener {
    pub(crate) fn new(options: SubscribeOptions) -> Self {
        let capacity = options.capacity.max(1);
        Listener {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity.min(DEFAULT_LISTENER_CAPACITY)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy: options.policy,
            dead: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Offer a copy of `event` without blocking.
    pub(crate) fn offer(&self, event: &Event) -> Offer {
        if self.is_dead() {
            return Offer::Skipped;
        }
        let offer = match self.policy {
            DropPolicy::DropNewest => self.offer_drop_newest(event),
            DropPolicy::DropOldest => self.offer_drop_oldest(event),
            DropPolicy::DropListener => self.offer_drop_listener(event),
        };
        match offer {
            Offer::Delivered => self.notify.notify_one(),
            Offer::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            Offer::Disconnected | Offer::Skipped => {}
        }
        offer
    }

    fn offer_drop_newest(&self, event: &Event) -> Offer {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Offer::Skipped;
        }
        if queue.items.len() >= self.capacity {
            return Offer::Dropped;
        }
        queue.items.push_back(event.clone());
        Offer::Delivered
    }

    fn offer_drop_oldest(&self, event: &Event) -> Offer {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Offer::Skipped;
        }
        // Evict and insert happen under one lock, so the slot freed here
        // cannot be taken by anyone else before the push.
        let evicted = if queue.items.len() >= self.capacity {
            queue.items.pop_front().is_some()
        } else {
            false
        };
        queue.items.push_back(event.clone());
        if evicted {
            Offer::Dropped
        } else {
            Offer::Delivered
        }
    }

    fn offer_drop_listener(&self, event: &Event) -> Offer {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                return Offer::Skipped;
            }
            if queue.items.len() < self.capacity {
                queue.items.push_back(event.clone());
                return Offer::Delivered;
            }
        }
        self.close();
        Offer::Disconnected
    }

    /// Mark dead and wake the consumer. Queued events stay readable.
    pub(crate) fn close(&self) {
        self.dead.store(true, Ordering::Release);
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Result<Option<Event>, Closed> {
        let mut queue = self.queue.lock();
        match queue.items.pop_front() {
            Some(event) => Ok(Some(event)),
            None if queue.closed => Err(Closed),
            None => Ok(None),
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().items.len()
    }
}

struct Closed;

type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Receiving half of a listener.
///
/// Dropping the subscription detaches it from its session.
pub struct Subscription {
    id: u64,
    listener: Arc<Listener>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(id: u64, listener: Arc<Listener>, unsubscribe: Unsubscribe) -> Self {
        Subscription {
            id,
            listener,
            unsubscribe: Some(unsubscribe),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.listener.notify.notified();
            match self.listener.pop() {
                Ok(Some(event)) => return Some(event),
                Err(Closed) => return None,
                Ok(None) => notified.await,
            }
        }
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        self.listener.pop().ok().flatten()
    }

    /// Events currently waiting in the queue
    pub fn pending(&self) -> usize {
        self.listener.len()
    }

    /// Events this subscriber lost to its drop policy
    pub fn dropped(&self) -> u64 {
        self.listener.dropped.load(Ordering::Relaxed)
    }

    /// Whether the session (or the drop policy) has closed this queue
    pub fn is_closed(&self) -> bool {
        self.listener.is_dead()
    }

    /// Detach from the session and close the queue.
    pub fn cancel(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        self.listener.close();
    }

    /// Consume the subscription as a stream of events
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

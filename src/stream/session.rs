//! Session - lifecycle, history and fan-out for one stream
//!
//! A session is created by a runtime, driven by its reader (and writer)
//! tasks through [`Session::publish`], observed by any number of
//! subscriptions and closed exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::constants::DEFAULT_HISTORY_CAPACITY;

use super::context::StreamContext;
use super::error::StreamError;
use super::event::{next_sequence, Event, Kind};
use super::listener::{Listener, Offer, SubscribeOptions, Subscription};
use super::ring::RingBuffer;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state. `Closed` and `Failed` are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    /// Peer started a graceful shutdown
    Closing,
    Closed,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Connecting => "connecting",
            State::Open => "open",
            State::Closing => "closing",
            State::Closed => "closed",
            State::Failed => "failed",
        }
    }
}

/// Aggregate counters for a session
#[derive(Clone, Debug)]
pub struct Stats {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub events: u64,
    pub bytes: u64,
    /// Events lost by listeners (drops plus disconnects)
    pub dropped: u64,
}

impl Stats {
    fn new() -> Self {
        Stats {
            started_at: Utc::now(),
            ended_at: None,
            events: 0,
            bytes: 0,
            dropped: 0,
        }
    }

    /// Elapsed time until close, or until now for a live session
    pub fn duration(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }
}

/// Construction parameters for a session
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub history_capacity: usize,
    /// Overall lifetime budget, becomes the context deadline
    pub total_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            total_timeout: None,
        }
    }
}

/// History and state captured atomically with a subscription
#[derive(Clone, Debug)]
pub struct SubscribeSnapshot {
    pub history: Vec<Event>,
    pub state: State,
    pub error: Option<StreamError>,
}

struct Shared {
    state: State,
    error: Option<StreamError>,
    ring: RingBuffer,
    listeners: HashMap<u64, Arc<Listener>>,
    stats: Stats,
}

struct Inner {
    id: String,
    kind: Kind,
    ctx: StreamContext,
    shared: Mutex<Shared>,
    /// Serializes sequence assignment with delivery so every listener sees
    /// the same relative order. Lock order: `delivery` before `shared`.
    delivery: Mutex<()>,
    closed: AtomicBool,
    done: CancellationToken,
    next_listener: AtomicU64,
}

/// Handle to one stream's lifecycle. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(kind: Kind, options: SessionOptions) -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = options.total_timeout.map(|total| Instant::now() + total);
        let session = Session {
            inner: Arc::new(Inner {
                id: format!("{}-{}", kind.as_str(), n),
                kind,
                ctx: StreamContext::new(deadline),
                shared: Mutex::new(Shared {
                    state: State::Connecting,
                    error: None,
                    ring: RingBuffer::new(options.history_capacity),
                    listeners: HashMap::new(),
                    stats: Stats::new(),
                }),
                delivery: Mutex::new(()),
                closed: AtomicBool::new(false),
                done: CancellationToken::new(),
                next_listener: AtomicU64::new(0),
            }),
        };
        tracing::debug!(session = %session.id(), "Session created");
        session
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn context(&self) -> &StreamContext {
        &self.inner.ctx
    }

    pub fn mark_open(&self) {
        self.set_state(State::Open);
    }

    pub fn mark_closing(&self) {
        self.set_state(State::Closing);
    }

    fn set_state(&self, state: State) {
        let mut shared = self.inner.shared.lock();
        if !shared.state.is_terminal() {
            shared.state = state;
        }
    }

    /// Whether `close` has been called
    pub fn is_terminal(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> (State, Option<StreamError>) {
        let shared = self.inner.shared.lock();
        (shared.state, shared.error.clone())
    }

    pub fn err(&self) -> Option<StreamError> {
        self.inner.shared.lock().error.clone()
    }

    pub fn stats_snapshot(&self) -> Stats {
        self.inner.shared.lock().stats.clone()
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.inner.shared.lock().ring.snapshot()
    }

    /// Future resolving once the session reached a terminal state
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.done.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Ask readers and writers to stop. State is left to whoever calls `close`.
    pub fn cancel(&self) {
        self.inner.ctx.cancel();
    }

    /// Record `event` in history and offer it to every live listener.
    ///
    /// Never blocks on a listener. Events published after close are ignored.
    pub fn publish(&self, mut event: Event) {
        if self.is_terminal() {
            return;
        }

        let _delivery = self.inner.delivery.lock();
        let listeners: Vec<Arc<Listener>> = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            if event.sequence == 0 {
                event.sequence = next_sequence();
            }
            if event.timestamp.is_none() {
                event.timestamp = Some(Utc::now());
            }
            shared.ring.append(event.clone());
            shared.stats.events += 1;
            shared.stats.bytes += event.payload.len() as u64;
            shared.listeners.retain(|_, listener| !listener.is_dead());
            shared.listeners.values().cloned().collect()
        };

        let mut dropped = 0u64;
        for listener in &listeners {
            match listener.offer(&event) {
                Offer::Dropped => dropped += 1,
                Offer::Disconnected => {
                    dropped += 1;
                    tracing::warn!(session = %self.inner.id, "Slow listener disconnected");
                }
                Offer::Delivered | Offer::Skipped => {}
            }
        }
        if dropped > 0 {
            self.inner.shared.lock().stats.dropped += dropped;
        }
    }

    /// Register a listener and capture history plus state in one step.
    ///
    /// Everything published before the call is in the snapshot, everything
    /// after it goes to the queue. On a terminal session the queue starts closed.
    pub fn subscribe(&self, options: SubscribeOptions) -> (Subscription, SubscribeSnapshot) {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        let listener = Arc::new(Listener::new(options));

        let snapshot = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                listener.close();
            } else {
                shared.listeners.insert(id, listener.clone());
            }
            SubscribeSnapshot {
                history: shared.ring.snapshot(),
                state: shared.state,
                error: shared.error.clone(),
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let unsubscribe = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.shared.lock().listeners.remove(&id);
            }
        });
        (Subscription::new(id, listener, unsubscribe), snapshot)
    }

    /// Move to `Closed` (no error) or `Failed`, exactly once.
    ///
    /// Later calls are no-ops. Closes every listener queue, cancels the
    /// context and fires `done`.
    pub fn close(&self, err: Option<StreamError>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let listeners: Vec<Arc<Listener>> = {
            let _delivery = self.inner.delivery.lock();
            let mut shared = self.inner.shared.lock();
            shared.state = if err.is_some() {
                State::Failed
            } else {
                State::Closed
            };
            shared.error = err.clone();
            shared.stats.ended_at = Some(Utc::now());
            shared.listeners.drain().map(|(_, listener)| listener).collect()
        };
        for listener in listeners {
            listener.close();
        }

        match &err {
            Some(err) => tracing::warn!(session = %self.inner.id, error = %err, "Session failed"),
            None => tracing::info!(session = %self.inner.id, "Session closed"),
        }

        self.inner.ctx.cancel();
        self.inner.done.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state().0)
            .finish()
    }
}

//! Manager - process-wide registry of live sessions
//!
//! Lets an operator view list or cancel open streams and lets callers
//! register a completion hook that runs once the session is done.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::StreamError;
use super::event::{Event, Kind};
use super::session::{Session, State, Stats};

/// Final view of a session handed to completion hooks
#[derive(Clone, Debug)]
pub struct Completion {
    pub id: String,
    pub kind: Kind,
    pub state: State,
    pub error: Option<StreamError>,
    pub stats: Stats,
    pub events: Vec<Event>,
}

impl Completion {
    fn capture(session: &Session) -> Self {
        let (state, error) = session.state();
        Completion {
            id: session.id().to_string(),
            kind: session.kind(),
            state,
            error,
            stats: session.stats_snapshot(),
            events: session.events_snapshot(),
        }
    }
}

/// Row of [`Manager::list`]
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: String,
    pub kind: Kind,
    pub state: State,
    pub stats: Stats,
}

pub type CompletionHook = Box<dyn FnOnce(&Completion) + Send + 'static>;

struct Entry {
    session: Session,
    hooks: Vec<CompletionHook>,
}

/// Registry of sessions keyed by id. Clones share the registry.
#[derive(Clone, Default)]
pub struct Manager {
    sessions: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session` until it is done. Must be called within a Tokio runtime.
    pub fn register(&self, session: Session) {
        self.insert(session, None);
    }

    /// Track `session` and run `hook` exactly once after it is done.
    pub fn register_with_hook<F>(&self, session: Session, hook: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.insert(session, Some(Box::new(hook)));
    }

    /// Attach another hook to an already registered session.
    /// Returns `false` when the id is unknown (or already finished).
    pub fn on_complete<F>(&self, id: &str, hook: F) -> bool
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        match self.sessions.lock().get_mut(id) {
            Some(entry) => {
                entry.hooks.push(Box::new(hook));
                true
            }
            None => false,
        }
    }

    fn insert(&self, session: Session, hook: Option<CompletionHook>) {
        let id = session.id().to_string();
        {
            let mut sessions = self.sessions.lock();
            let entry = sessions.entry(id.clone()).or_insert_with(|| Entry {
                session: session.clone(),
                hooks: Vec::new(),
            });
            entry.hooks.extend(hook);
        }
        tracing::debug!(session = %id, "Session registered");

        let registry = self.sessions.clone();
        let done = session.done();
        tokio::spawn(async move {
            done.await;
            let Some(entry) = registry.lock().remove(&id) else {
                return;
            };
            let completion = Completion::capture(&entry.session);
            for hook in entry.hooks {
                hook(&completion);
            }
            tracing::debug!(session = %id, state = completion.state.as_str(), "Session finished");
        });
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).map(|entry| entry.session.clone())
    }

    /// Snapshot of every tracked session, ordered by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|session| SessionInfo {
                id: session.id().to_string(),
                kind: session.kind(),
                state: session.state().0,
                stats: session.stats_snapshot(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Signal the session to stop. Returns `false` for unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                tracing::info!(session = %id, "Cancelling session");
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        for session in sessions {
            session.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::Direction;
    use crate::stream::session::SessionOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn open_session() -> Session {
        let session = Session::new(Kind::WebSocket, SessionOptions::default());
        session.mark_open();
        session
    }

    #[tokio::test]
    async fn test_hook_runs_once_after_done() {
        let manager = Manager::new();
        let session = open_session();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = calls.clone();
        manager.register_with_hook(session.clone(), move |done| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((done.state, done.events.len()));
        });
        assert_eq!(manager.len(), 1);

        session.publish(Event::new(Kind::WebSocket, Direction::Receive, "x"));
        session.close(None);
        session.close(None);

        let (state, events) = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, State::Closed);
        assert_eq!(events, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_list_and_cancel() {
        let manager = Manager::new();
        let a = open_session();
        let b = open_session();
        manager.register(a.clone());
        manager.register(b.clone());

        let ids: Vec<String> = manager.list().into_iter().map(|info| info.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id().to_string()));

        assert!(manager.cancel(a.id()));
        assert!(a.context().err().is_some());
        assert!(b.context().err().is_none());
        assert!(!manager.cancel("websocket-unknown"));

        manager.cancel_all();
        assert!(b.context().err().is_some());
    }

    #[tokio::test]
    async fn test_on_complete_for_unknown_id() {
        let manager = Manager::new();
        assert!(!manager.on_complete("nope", |_| {}));
    }
}

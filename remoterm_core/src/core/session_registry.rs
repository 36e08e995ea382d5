use std::collections::{HashMap, VecDeque};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::SessionError;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Error,
    Closed,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub profile_id: Option<String>,
    pub state: SessionState,
    /// Output chunks in arrival order, oldest first.
    pub output: VecDeque<String>,
    pub message_count: u64,
}

type AckSender = oneshot::Sender<Result<(), String>>;

struct SessionEntry {
    session: Session,
    /// `data` of the `session_create` frame, kept for re-announcing.
    create_payload: Option<String>,
    /// Transport attempt the backend last heard `session_create` on.
    link: Option<u64>,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    pending_ack: Option<AckSender>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    UnknownSession,
}

/// Single owner of all session records.
///
/// Every method takes the lock for one short, non-async step; nothing here
/// ever waits on the network.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    max_buffered_chunks: usize,
}

impl SessionRegistry {
    pub fn new(max_buffered_chunks: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_buffered_chunks: max_buffered_chunks.max(1),
        }
    }

    /// Register a new session in `Initializing`, announced on `link`.
    pub fn insert(
        &self,
        id: &str,
        profile_id: Option<String>,
        create_payload: Option<String>,
        link: Option<u64>,
        ack: AckSender,
    ) -> Result<(), SessionError> {
        let mut map = self.sessions.lock();
        if map.contains_key(id) {
            return Err(SessionError::DuplicateSession(id.to_string()));
        }
        map.insert(
            id.to_string(),
            SessionEntry {
                session: Session {
                    id: id.to_string(),
                    profile_id,
                    state: SessionState::Initializing,
                    output: VecDeque::new(),
                    message_count: 0,
                },
                create_payload,
                link,
                subscribers: Vec::new(),
                pending_ack: Some(ack),
            },
        );
        Ok(())
    }

    /// Drop the record; buffered output and subscriber channels go with it.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let entry = self.sessions.lock().remove(id)?;
        let mut session = entry.session;
        session.state = SessionState::Closed;
        Some(session)
    }

    pub fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.lock().get(id).map(|e| e.session.state)
    }

    pub fn snapshot(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).map(|e| e.session.clone())
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure_running(&self, id: &str) -> Result<(), SessionError> {
        match self.state(id) {
            None => Err(SessionError::UnknownSession(id.to_string())),
            Some(SessionState::Running) => Ok(()),
            Some(state) => Err(SessionError::SessionNotRunning {
                id: id.to_string(),
                state,
            }),
        }
    }

    /// Buffer `data` and hand it to every live subscriber of `id`.
    pub fn route_output(&self, id: &str, data: String) -> RouteOutcome {
        let mut map = self.sessions.lock();
        let Some(entry) = map.get_mut(id) else {
            return RouteOutcome::UnknownSession;
        };
        entry.subscribers.retain(|tx| tx.send(data.clone()).is_ok());
        let session = &mut entry.session;
        if session.output.len() == self.max_buffered_chunks {
            session.output.pop_front();
        }
        session.output.push_back(data);
        session.message_count += 1;
        RouteOutcome::Delivered
    }

    /// Backend confirmed `session_create`. Returns `false` if nothing was waiting.
    pub fn acknowledge(&self, id: &str) -> bool {
        let mut map = self.sessions.lock();
        let Some(entry) = map.get_mut(id) else {
            return false;
        };
        if entry.session.state != SessionState::Initializing {
            return false;
        }
        entry.session.state = SessionState::Running;
        if let Some(ack) = entry.pending_ack.take() {
            let _ = ack.send(Ok(()));
        }
        true
    }

    /// Move the session to `Error`, failing a pending creation if any.
    pub fn fail(&self, id: &str, reason: &str) -> bool {
        let mut map = self.sessions.lock();
        let Some(entry) = map.get_mut(id) else {
            return false;
        };
        entry.session.state = SessionState::Error;
        if let Some(ack) = entry.pending_ack.take() {
            let _ = ack.send(Err(reason.to_string()));
        }
        true
    }

    pub fn subscribe(&self, id: &str) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut map = self.sessions.lock();
        let entry = map.get_mut(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        entry.subscribers.push(tx);
        Some(rx)
    }

    /// Buffered output of `id`; empty for unknown or closed sessions.
    pub fn messages(&self, id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .get(id)
            .map(|e| e.session.output.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions the backend has not seen on `link` yet. They go back to
    /// `Initializing` and count as announced on `link` from now on.
    pub fn prepare_reannounce(&self, link: u64) -> Vec<(SessionId, Option<String>)> {
        let mut map = self.sessions.lock();
        let mut out = Vec::new();
        for (id, entry) in map.iter_mut() {
            // attempt ids only grow
            if entry.link.is_some_and(|known| known >= link) {
                continue;
            }
            debug!("Re-announcing session '{}' on link {}", id, link);
            entry.link = Some(link);
            entry.session.state = SessionState::Initializing;
            out.push((id.clone(), entry.create_payload.clone()));
        }
        out
    }
}

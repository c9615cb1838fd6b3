//! Connection sessions and the registry that tracks them.
//!
//! The accept loop admits a session, the session's worker marks it complete
//! as its last act, and the main control loop reaps it (joins the worker and
//! drops the record). Every membership change and every read or write of the
//! completion flag happens under the registry lock.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Identifier of a session inside the registry.
pub type SessionId = usize;

/// Current state of a connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading request bytes and appending them to the log.
    Receiving,
    /// A newline was seen; the request is fully appended.
    FramingComplete,
    /// Streaming the full log back to the peer.
    Responding,
    /// Connection closed, session about to be marked complete.
    Done,
}

/// Record of one accepted connection.
#[derive(Debug)]
pub struct Session {
    /// Address of the remote peer.
    pub peer: SocketAddr,
    /// Worker serving this connection, once spawned.
    worker: Option<JoinHandle<()>>,
    /// Set exactly once by the worker when it is finished.
    complete: bool,
}

impl Session {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            worker: None,
            complete: false,
        }
    }

    fn reapable(&self) -> bool {
        self.complete && self.worker.is_some()
    }
}

/// Registry of live sessions using slab allocation.
///
/// Capacity bounds the number of connections served at once.
pub struct SessionRegistry {
    sessions: Mutex<Slab<Session>>,
    completed: Condvar,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(Slab::with_capacity(max_sessions)),
            completed: Condvar::new(),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a new session.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&self, peer: SocketAddr) -> Option<SessionId> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            return None;
        }
        Some(sessions.insert(Session::new(peer)))
    }

    /// Record the worker thread serving `id`.
    pub fn attach(&self, id: SessionId, worker: JoinHandle<()>) {
        let mut sessions = self.lock();
        match sessions.get_mut(id) {
            Some(session) => session.worker = Some(worker),
            None => warn!(session = id, "Attaching worker to unknown session"),
        }
    }

    /// Drop a session whose worker never started.
    pub fn discard(&self, id: SessionId) -> Option<Session> {
        self.lock().try_remove(id)
    }

    /// Mark the session finished. Called by its worker as the last thing it
    /// does before returning.
    pub fn mark_complete(&self, id: SessionId) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(id) {
            session.complete = true;
        }
        self.completed.notify_all();
    }

    /// Join and remove every session whose worker has finished.
    ///
    /// Returns the number of sessions reaped.
    pub fn reap_completed(&self) -> usize {
        let mut sessions = self.lock();
        Self::reap_locked(&mut sessions)
    }

    /// Block until every session has completed and been reaped.
    pub fn drain(&self) -> usize {
        let mut sessions = self.lock();
        let mut reaped = 0;
        loop {
            reaped += Self::reap_locked(&mut sessions);
            if sessions.is_empty() {
                return reaped;
            }
            debug!(remaining = sessions.len(), "Waiting for connection workers");
            sessions = self
                .completed
                .wait(sessions)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn reap_locked(sessions: &mut Slab<Session>) -> usize {
        let done: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, session)| session.reapable())
            .map(|(id, _)| id)
            .collect();

        for &id in &done {
            let mut session = sessions.remove(id);
            if let Some(worker) = session.worker.take() {
                // The worker has already marked itself complete, so this
                // only waits for the thread to unwind its stack.
                if worker.join().is_err() {
                    warn!(session = id, peer = %session.peer, "Connection worker panicked");
                }
            }
            debug!(session = id, peer = %session.peer, "Reaped session");
        }
        done.len()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no sessions.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of sessions allowed.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

/// Marks a session complete when dropped, so a worker that unwinds still
/// releases its slot.
pub struct CompletionGuard<'a> {
    registry: &'a SessionRegistry,
    id: SessionId,
}

impl<'a> CompletionGuard<'a> {
    pub fn new(registry: &'a SessionRegistry, id: SessionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.registry.mark_complete(self.id);
    }
}

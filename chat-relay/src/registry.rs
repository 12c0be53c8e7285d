use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

pub type SessionId = u64;

/// Why a single recipient could not take a broadcast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session {0} is no longer connected")]
    Closed(SessionId),
    #[error("outbound queue for session {0} is full")]
    Full(SessionId),
}

/// Registry-side view of a session: its id and the sending end of its
/// outbound queue. The session's writer task owns the receiving end.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::Sender<String>) -> Self {
        Self { id, outbound }
    }

    /// Creates a handle together with the queue its writer drains.
    pub fn channel(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        (Self::new(id, outbound), inbox)
    }

    /// True while the session's writer is still draining the queue.
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queues one line for the client. Never waits on the client's socket.
    pub fn send_message(&self, text: &str) -> Result<(), DeliveryError> {
        self.outbound
            .try_send(text.to_string())
            .map_err(|err| match err {
                TrySendError::Full(_) => DeliveryError::Full(self.id),
                TrySendError::Closed(_) => DeliveryError::Closed(self.id),
            })
    }
}

/// The set of sessions eligible to receive broadcasts.
///
/// Membership changes take the write lock and broadcasts iterate under the
/// read lock, so a broadcast either sees a session or it doesn't; nothing
/// reaches a session once its removal has started.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(handle.id).or_insert(handle);
    }

    /// Returns whether the session was still registered.
    pub async fn remove(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id).is_some()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Delivers `message` to every registered session except `exclude` and
    /// returns how many of them accepted it.
    ///
    /// A recipient that is gone or too far behind is skipped; the rest of the
    /// fan-out carries on regardless.
    pub async fn broadcast(&self, message: &str, exclude: Option<SessionId>) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;

        for (id, handle) in sessions.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match handle.send_message(message) {
                Ok(()) => delivered += 1,
                Err(err @ DeliveryError::Full(_)) => {
                    warn!(session = id, error = %err, "dropping message for slow session");
                }
                Err(err @ DeliveryError::Closed(_)) => {
                    debug!(session = id, error = %err, "skipping disconnected session");
                }
            }
        }

        delivered
    }
}

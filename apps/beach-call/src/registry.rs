use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::signaling::ServerMessage;

/// Channel feeding a connection's socket writer task.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Identity assigned to a connection when its socket is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("connection for session {0} is closed")]
pub struct DeliveryError(pub SessionId);

/// Deliver a message on a connection's outbound channel.
pub fn deliver(
    session_id: SessionId,
    outbound: &Outbound,
    message: ServerMessage,
) -> Result<(), DeliveryError> {
    outbound
        .send(message)
        .map_err(|_| DeliveryError(session_id))
}

/// A registered user.
#[derive(Debug)]
pub struct UserSession {
    pub id: SessionId,
    pub name: String,
    outbound: Outbound,
    /// Name of the user this session is currently paired with.
    pub peer: Option<String>,
    /// Offer submitted with the last `call` this session placed.
    pub sdp_offer: Option<String>,
}

impl UserSession {
    pub fn new(id: SessionId, name: String, outbound: Outbound) -> Self {
        Self {
            id,
            name,
            outbound,
            peer: None,
            sdp_offer: None,
        }
    }

    pub fn send(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        deliver(self.id, &self.outbound, message)
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }
}

/// Registered users indexed by session id and by display name.
///
/// Sessions are owned by the id map; the name map only holds ids, so the two
/// indexes always describe the same set of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_id: HashMap<SessionId, UserSession>,
    by_name: HashMap<String, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. Callers check name availability first; a session
    /// whose name is taken is handed back untouched.
    pub fn register(&mut self, session: UserSession) -> Result<(), UserSession> {
        if self.by_name.contains_key(&session.name) || self.by_id.contains_key(&session.id) {
            return Err(session);
        }
        self.by_name.insert(session.name.clone(), session.id);
        self.by_id.insert(session.id, session);
        Ok(())
    }

    pub fn unregister(&mut self, id: SessionId) -> Option<UserSession> {
        let session = self.by_id.remove(&id)?;
        if self.by_name.get(&session.name) == Some(&id) {
            self.by_name.remove(&session.name);
        }
        Some(session)
    }

    pub fn get_by_id(&self, id: SessionId) -> Option<&UserSession> {
        self.by_id.get(&id)
    }

    pub fn get_by_id_mut(&mut self, id: SessionId) -> Option<&mut UserSession> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&UserSession> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

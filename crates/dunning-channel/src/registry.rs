//! Process-wide map of live sessions.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::ChannelError;
use crate::transport::{ChatSocket, Destination};

/// A usable connection for one session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    phone: Option<String>,
    connected_at: DateTime<Utc>,
    socket: Arc<dyn ChatSocket>,
}

impl SessionHandle {
    pub fn new(
        session_id: impl Into<String>,
        socket: Arc<dyn ChatSocket>,
        phone: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            phone,
            connected_at: Utc::now(),
            socket,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn uses_socket(&self, socket: &Arc<dyn ChatSocket>) -> bool {
        Arc::ptr_eq(&self.socket, socket)
    }

    pub async fn send_text(&self, to: &Destination, text: &str) -> Result<(), ChannelError> {
        self.socket.send_text(to, text).await
    }

    pub async fn is_on_network(&self, to: &Destination) -> Result<bool, ChannelError> {
        self.socket.is_on_network(to).await
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        self.socket.close().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("phone", &self.phone)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// The only authority on which sessions are connected right now.
///
/// Mutated by the lifecycle manager; everything else reads.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Register `handle`, returning the handle it replaced.
    #[instrument(skip(self, handle), fields(session_id = %handle.session_id))]
    pub fn set(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let previous = self.sessions.insert(handle.session_id.clone(), handle);
        debug!(replaced = previous.is_some(), "Session registered");
        previous
    }

    #[instrument(skip(self))]
    pub fn delete(&self, session_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(session_id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!("Session unregistered");
        }
        removed
    }

    /// Remove the session only if it is still backed by `socket`.
    pub fn delete_if_socket(
        &self,
        session_id: &str,
        socket: &Arc<dyn ChatSocket>,
    ) -> Option<SessionHandle> {
        self.sessions
            .remove_if(session_id, |_, handle| handle.uses_socket(socket))
            .map(|(_, handle)| handle)
    }

    /// Remove and return every registered session.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let ids: Vec<String> = self.session_ids();
        ids.iter().filter_map(|id| self.delete(id)).collect()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct NullSocket;

    #[async_trait]
    impl ChatSocket for NullSocket {
        async fn send_text(&self, _to: &Destination, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn is_on_network(&self, _to: &Destination) -> Result<bool, ChannelError> {
            Ok(true)
        }

        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn socket() -> Arc<dyn ChatSocket> {
        Arc::new(NullSocket)
    }

    #[test]
    fn test_set_get_delete() {
        let registry = SessionRegistry::new();
        assert!(registry.get("s1").is_none());

        assert!(registry.set(SessionHandle::new("s1", socket(), None)).is_none());
        assert!(registry.contains("s1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("s1").unwrap().session_id(), "s1");

        assert!(registry.delete("s1").is_some());
        assert!(registry.delete("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_replaces_existing_handle() {
        let registry = SessionRegistry::new();
        registry.set(SessionHandle::new("s1", socket(), None));
        let replaced = registry.set(SessionHandle::new("s1", socket(), Some("55119".into())));

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("s1").unwrap().phone(), Some("55119"));
    }

    #[test]
    fn test_delete_if_socket_ignores_newer_handle() {
        let registry = SessionRegistry::new();
        let old = socket();
        let new = socket();
        registry.set(SessionHandle::new("s1", Arc::clone(&new), None));

        assert!(registry.delete_if_socket("s1", &old).is_none());
        assert!(registry.contains("s1"));

        assert!(registry.delete_if_socket("s1", &new).is_some());
        assert!(!registry.contains("s1"));
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = SessionRegistry::new();
        registry.set(SessionHandle::new("s1", socket(), None));
        registry.set(SessionHandle::new("s2", socket(), None));

        let mut drained: Vec<_> = registry
            .drain()
            .into_iter()
            .map(|handle| handle.session_id().to_string())
            .collect();
        drained.sort();

        assert_eq!(drained, vec!["s1", "s2"]);
        assert!(registry.is_empty());
    }
}

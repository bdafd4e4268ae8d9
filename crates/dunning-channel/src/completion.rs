//! Single-resolution result slot for a connect attempt.
//!
//! Several raw socket events map to the same logical outcome (a pairing
//! code can be refreshed, an open can follow a pairing); only the first one
//! reaches the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::ChannelError;

/// What a caller of `start` learns about its connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The device must be paired; `qr` is a renderable image URL.
    Pairing { qr: String },
    Ready { session_id: String },
}

struct Slot {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<ConnectOutcome>>>,
}

/// Settles the outcome. Cheap to clone; every clone shares one slot.
#[derive(Clone)]
pub struct ConnectResolver {
    slot: Arc<Slot>,
}

impl ConnectResolver {
    /// Returns `false` if the outcome was already settled.
    pub fn resolve(&self, outcome: ConnectOutcome) -> bool {
        if self.slot.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        let sender = self
            .slot
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The caller may have stopped waiting; that is fine.
            let _ = sender.send(outcome);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.resolved.load(Ordering::Acquire)
    }
}

/// Caller side of the slot.
pub struct ConnectWaiter {
    session_id: String,
    receiver: oneshot::Receiver<ConnectOutcome>,
}

impl ConnectWaiter {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the outcome. Fails only if every resolver was dropped
    /// unresolved, i.e. the session was torn down first.
    pub async fn wait(self) -> Result<ConnectOutcome, ChannelError> {
        self.receiver
            .await
            .map_err(|_| ChannelError::SessionTerminated(self.session_id))
    }

    /// Like [`wait`](Self::wait), but `Ok(None)` once `limit` elapses.
    pub async fn wait_timeout(self, limit: Duration) -> Result<Option<ConnectOutcome>, ChannelError> {
        let session_id = self.session_id;
        match tokio::time::timeout(limit, self.receiver).await {
            Ok(Ok(outcome)) => Ok(Some(outcome)),
            Ok(Err(_)) => Err(ChannelError::SessionTerminated(session_id)),
            Err(_) => Ok(None),
        }
    }
}

pub fn connect_slot(session_id: impl Into<String>) -> (ConnectResolver, ConnectWaiter) {
    let (sender, receiver) = oneshot::channel();
    let resolver = ConnectResolver {
        slot: Arc::new(Slot {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }),
    };
    let waiter = ConnectWaiter {
        session_id: session_id.into(),
        receiver,
    };
    (resolver, waiter)
}

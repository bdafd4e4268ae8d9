use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dunning_channel::{
    ChannelError, ChatConnector, ChatSocket, Credentials, Destination, SocketEvent, SocketEvents,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub text: String,
}

/// Scriptable [`ChatSocket`] recording what was sent through it.
#[derive(Default)]
pub struct FakeSocket {
    sent: Mutex<Vec<SentMessage>>,
    off_network: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    lookup_errors: AtomicBool,
    closed: AtomicBool,
}

impl FakeSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Report `digits` as having no account on the network.
    pub fn mark_off_network(&self, digits: &str) {
        self.off_network
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digits.to_string());
    }

    /// Make sends to `digits` fail with a transport error.
    pub fn fail_sends_to(&self, digits: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digits.to_string());
    }

    pub fn fail_lookups(&self) {
        self.lookup_errors.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatSocket for FakeSocket {
    async fn send_text(&self, to: &Destination, text: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::NotConnected(to.to_string()));
        }
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(to.digits())
        {
            return Err(ChannelError::Transport(format!("send to {to} refused")));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                to: to.digits().to_string(),
                text: text.to_string(),
            });
        Ok(())
    }

    async fn is_on_network(&self, to: &Destination) -> Result<bool, ChannelError> {
        if self.lookup_errors.load(Ordering::SeqCst) {
            return Err(ChannelError::Timeout);
        }
        Ok(!self
            .off_network
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(to.digits()))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One socket handed out by [`FakeConnector`], with the sending half of its
/// event channel so tests can play the network's part.
#[derive(Clone)]
pub struct OpenedSession {
    pub session_id: String,
    pub credentials: Credentials,
    pub socket: Arc<FakeSocket>,
    events: mpsc::Sender<SocketEvent>,
}

impl OpenedSession {
    pub async fn emit(&self, event: SocketEvent) {
        // The driver may already be gone; tests assert on its effects instead.
        let _ = self.events.send(event).await;
    }
}

pub struct FakeConnector {
    opened_tx: mpsc::UnboundedSender<OpenedSession>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OpenedSession>>,
    opens: AtomicUsize,
    failures_left: AtomicUsize,
}

impl Default for FakeConnector {
    fn default() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            opened_tx,
            opened_rx: tokio::sync::Mutex::new(opened_rx),
            opens: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `open` with a transport error.
    pub fn fail_next_opens(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Total successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait for the next successful `open`.
    pub async fn next_open(&self) -> Option<OpenedSession> {
        self.opened_rx.lock().await.recv().await
    }
}

#[async_trait]
impl ChatConnector for FakeConnector {
    async fn open(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<(Arc<dyn ChatSocket>, SocketEvents), ChannelError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Transport("network unreachable".to_string()));
        }

        let (events, rx) = mpsc::channel(16);
        let socket = Arc::new(FakeSocket::new());
        self.opens.fetch_add(1, Ordering::SeqCst);
        let _ = self.opened_tx.send(OpenedSession {
            session_id: session_id.to_string(),
            credentials,
            socket: Arc::clone(&socket),
            events,
        });
        let socket: Arc<dyn ChatSocket> = socket;
        Ok((socket, rx))
    }
}

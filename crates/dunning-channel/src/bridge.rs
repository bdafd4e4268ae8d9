//! Transport that reaches the chat network through an HTTP bridge sidecar.
//!
//! The bridge owns the network protocol; this side opens sessions, long-polls
//! their events by sequence number and issues sends and contact lookups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::credentials::Credentials;
use crate::error::ChannelError;
use crate::transport::{
    ChatConnector, ChatSocket, Destination, DisconnectReason, SocketEvent, SocketEvents,
};

const EVENT_BUFFER: usize = 32;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BridgeConnector {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl BridgeConnector {
    pub fn new(base_url: &str) -> Result<Self, ChannelError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ChannelError::Transport(format!("invalid bridge url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ChannelError::Transport(format!(
                "unsupported bridge url scheme: {}",
                parsed.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Pause between polls that returned no events.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}", self.base_url, session_id)
    }
}

#[derive(Serialize)]
struct OpenRequest<'a> {
    credentials: &'a Credentials,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ContactResponse {
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    #[serde(default)]
    events: Vec<EventEnvelope>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    seq: u64,
    #[serde(flatten)]
    event: BridgeEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Credentials {
        credentials: Credentials,
    },
    Open {
        #[serde(default)]
        phone: Option<String>,
    },
    Close {
        status_code: u16,
    },
    /// Event types this side does not act on.
    #[serde(other)]
    Unknown,
}

impl BridgeEvent {
    fn into_socket_event(self) -> Option<SocketEvent> {
        match self {
            BridgeEvent::Qr { code } => Some(SocketEvent::Pairing { payload: code }),
            BridgeEvent::Credentials { credentials } => {
                Some(SocketEvent::CredentialsUpdated(credentials))
            }
            BridgeEvent::Open { phone } => Some(SocketEvent::Open { phone }),
            BridgeEvent::Close { status_code } => Some(SocketEvent::Closed {
                reason: DisconnectReason::from_status_code(status_code),
            }),
            BridgeEvent::Unknown => None,
        }
    }
}

#[async_trait]
impl ChatConnector for BridgeConnector {
    #[instrument(skip(self, credentials))]
    async fn open(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<(Arc<dyn ChatSocket>, SocketEvents), ChannelError> {
        let url = self.session_url(session_id);
        self.http
            .post(&url)
            .json(&OpenRequest {
                credentials: &credentials,
            })
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let poller = EventPoller {
            http: self.http.clone(),
            events_url: format!("{url}/events"),
            poll_interval: self.poll_interval,
            cancel: cancel.clone(),
            tx,
        };
        tokio::spawn(poller.run());

        debug!("Bridge session opened");
        let socket: Arc<dyn ChatSocket> = Arc::new(BridgeSocket {
            http: self.http.clone(),
            session_url: url,
            cancel,
        });
        Ok((socket, rx))
    }
}

struct EventPoller {
    http: reqwest::Client,
    events_url: String,
    poll_interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<SocketEvent>,
}

impl EventPoller {
    async fn run(self) {
        let mut cursor = 0_u64;
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => return,
                batch = self.poll(cursor) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(url = %self.events_url, error = %e, "Bridge event poll failed");
                    let _ = self
                        .tx
                        .send(SocketEvent::Closed {
                            reason: DisconnectReason::ConnectionLost,
                        })
                        .await;
                    return;
                }
            };

            if batch.events.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            for envelope in batch.events {
                cursor = cursor.max(envelope.seq);
                let Some(event) = envelope.event.into_socket_event() else {
                    debug!(url = %self.events_url, seq = envelope.seq, "Skipping unknown bridge event");
                    continue;
                };
                let closed = matches!(event, SocketEvent::Closed { .. });
                if self.tx.send(event).await.is_err() || closed {
                    return;
                }
            }
        }
    }

    async fn poll(&self, cursor: u64) -> Result<EventBatch, ChannelError> {
        let batch = self
            .http
            .get(&self.events_url)
            .query(&[("after", cursor)])
            .send()
            .await?
            .error_for_status()?
            .json::<EventBatch>()
            .await?;
        Ok(batch)
    }
}

struct BridgeSocket {
    http: reqwest::Client,
    session_url: String,
    cancel: CancellationToken,
}

#[async_trait]
impl ChatSocket for BridgeSocket {
    async fn send_text(&self, to: &Destination, text: &str) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::NotConnected(self.session_url.clone()));
        }
        self.http
            .post(format!("{}/messages", self.session_url))
            .json(&SendRequest {
                to: to.digits(),
                text,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn is_on_network(&self, to: &Destination) -> Result<bool, ChannelError> {
        let contact = self
            .http
            .get(format!("{}/contacts/{}", self.session_url, to.digits()))
            .send()
            .await?
            .error_for_status()?
            .json::<ContactResponse>()
            .await?;
        Ok(contact.exists)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();

        let response = self.http.delete(&self.session_url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

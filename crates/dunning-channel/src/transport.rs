use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::error::ChannelError;

/// Network address of a recipient, derived from a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    /// Keep only the ASCII digits of `phone`.
    pub fn from_phone(phone: &str) -> Result<Self, ChannelError> {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(ChannelError::InvalidDestination(phone.to_string()));
        }
        Ok(Self(digits))
    }

    pub fn digits(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the network closed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account signed this device out. Terminal.
    LoggedOut,
    ConnectionLost,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Unavailable,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 => DisconnectReason::ConnectionLost,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            503 => DisconnectReason::Unavailable,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::BadSession => 500,
            DisconnectReason::Unavailable => 503,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::Other(code) => *code,
        }
    }

    pub fn is_logout(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::LoggedOut => "logged out",
            DisconnectReason::ConnectionLost => "connection lost",
            DisconnectReason::ConnectionClosed => "connection closed",
            DisconnectReason::ConnectionReplaced => "connection replaced",
            DisconnectReason::BadSession => "bad session",
            DisconnectReason::Unavailable => "service unavailable",
            DisconnectReason::RestartRequired => "restart required",
            DisconnectReason::Other(_) => "unknown",
        };
        write!(f, "{name} ({})", self.status_code())
    }
}

/// Raw events emitted by an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// The network wants the device paired; `payload` is the raw code.
    Pairing { payload: String },
    CredentialsUpdated(Credentials),
    Open { phone: Option<String> },
    Closed { reason: DisconnectReason },
}

pub type SocketEvents = mpsc::Receiver<SocketEvent>;

/// A live connection to the chat network.
#[async_trait]
pub trait ChatSocket: Send + Sync + 'static {
    async fn send_text(&self, to: &Destination, text: &str) -> Result<(), ChannelError>;

    /// Whether `to` has an account on the network.
    async fn is_on_network(&self, to: &Destination) -> Result<bool, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Opens sockets to the chat network.
///
/// The returned receiver yields events until the socket closes; a receiver
/// that ends without a `Closed` event is treated as a lost connection.
#[async_trait]
pub trait ChatConnector: Send + Sync + 'static {
    async fn open(
        &self,
        session_id: &str,
        credentials: Credentials,
    ) -> Result<(Arc<dyn ChatSocket>, SocketEvents), ChannelError>;
}

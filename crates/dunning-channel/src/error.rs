use dunning_core::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("Pairing code could not be rendered: {0}")]
    Pairing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Session is not connected: {0}")]
    NotConnected(String),

    #[error("Session {0} was torn down before pairing or ready")]
    SessionTerminated(String),

    #[error("Persistence error: {0}")]
    Gateway(#[from] GatewayError),
}

impl ChannelError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(_) | ChannelError::Timeout => true,
            ChannelError::Gateway(GatewayError::Unavailable(_)) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChannelError::Timeout
        } else {
            ChannelError::Transport(err.to_string())
        }
    }
}

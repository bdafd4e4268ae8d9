use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dunning_core::Topic;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::ChannelError;

const CREDENTIALS_FILE: &str = "creds.json";

/// Pairing credentials needed to resume a session without scanning a new
/// code. `material` is owned by the transport and never inspected here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    /// Account the device is paired with; `None` until pairing completes.
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub material: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Credentials {
    /// Unregistered credentials for a brand new device.
    pub fn fresh() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            me: None,
            material: serde_json::Value::Null,
            updated_at: Utc::now(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.me.is_some()
    }
}

/// Durable, session-keyed storage of [`Credentials`].
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ChannelError>;

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ChannelError>;

    /// Remove the session's credentials. Deleting nothing is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), ChannelError>;
}

pub(crate) fn validate_session_id(session_id: &str) -> Result<(), ChannelError> {
    if Topic::is_valid(session_id) {
        Ok(())
    } else {
        Err(ChannelError::InvalidSessionId(session_id.to_string()))
    }
}

/// Stores each session under `<root>/<session_id>/creds.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, ChannelError> {
        validate_session_id(session_id)?;
        Ok(self.root.join(session_id))
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> ChannelError {
    ChannelError::Credentials(format!("failed to {action} {}: {err}", path.display()))
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    #[instrument(skip(self))]
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ChannelError> {
        let path = self.session_dir(session_id)?.join(CREDENTIALS_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &path, e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                // Unreadable state cannot resume a session; pair again instead.
                warn!(path = %path.display(), error = %e, "Discarding malformed credentials");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, credentials))]
    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ChannelError> {
        let dir = self.session_dir(session_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))?;

        let json = serde_json::to_vec_pretty(credentials)
            .map_err(|e| ChannelError::Credentials(e.to_string()))?;

        let tmp = dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        let path = dir.join(CREDENTIALS_FILE);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))?;

        debug!(path = %path.display(), "Credentials saved");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, session_id: &str) -> Result<(), ChannelError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "Credentials deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &dir, e)),
        }
    }
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    entries: DashMap<String, Credentials>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Credentials> {
        self.entries.get(session_id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, session_id: &str) -> Result<Option<Credentials>, ChannelError> {
        validate_session_id(session_id)?;
        Ok(self.get(session_id))
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> Result<(), ChannelError> {
        validate_session_id(session_id)?;
        self.entries
            .insert(session_id.to_string(), credentials.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), ChannelError> {
        validate_session_id(session_id)?;
        self.entries.remove(session_id);
        Ok(())
    }
}

//! Outbound messaging channel.
//!
//! One session per tenant: [`ConnectionLifecycleManager`] drives pairing,
//! open, reconnect and logout for each session id, keeps the
//! [`SessionRegistry`] authoritative about which sessions are usable right
//! now, and persists credentials through a [`CredentialStore`] so sessions
//! survive restarts without re-pairing.

pub mod bridge;
pub mod completion;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod pairing;
pub mod registry;
pub mod transport;

pub use bridge::BridgeConnector;
pub use completion::{ConnectOutcome, ConnectResolver, ConnectWaiter};
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, InMemoryCredentialStore};
pub use error::ChannelError;
pub use lifecycle::{ConnectionLifecycleManager, SessionState};
pub use registry::{SessionHandle, SessionRegistry};
pub use transport::{ChatConnector, ChatSocket, Destination, DisconnectReason, SocketEvent, SocketEvents};

pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod model;

pub use error::{EventBusError, GatewayError};
pub use event::{BroadcastEventBus, EventBus, EventSubscription, StatusEvent, Topic};
pub use gateway::PersistenceGateway;
pub use model::{
    Client, Connection, DueClient, DueWindow, MessageTemplate, PaymentKey, Product,
};

use dunning_channel::ChannelError;
use dunning_core::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("Persistence error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Client {0} has no due date")]
    MissingDueDate(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

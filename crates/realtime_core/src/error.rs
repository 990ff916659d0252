use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("channel {0} is not subscribed")]
    NotSubscribed(String),
    #[error("channel {name} was already removed")]
    ChannelRemoved { name: String },
    #[error("join rejected for channel {name}: {reason}")]
    JoinRejected { name: String, reason: String },
    #[error("realtime transport is not connected")]
    TransportClosed,
    #[error("injected failure on channel {0}")]
    Injected(String),
}

use peernet_common::SchedulerError;
use peernet_crypto::CryptoError;
use peernet_types::{Address, ConnectionId, TransportType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No running transport for {transport_type}")]
    TransportUnavailable { transport_type: TransportType },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: Address, reason: String },

    #[error("Failed to send to {address}: {reason}")]
    SendFailed { address: Address, reason: String },

    #[error("Connection {connection_id} closed")]
    ConnectionClosed { connection_id: ConnectionId },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Request already pending: {0}")]
    AlreadyPending(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid node state: {0}")]
    InvalidState(String),

    #[error("Node is shutting down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

impl From<NetworkError> for peernet_types::PeerNetError {
    fn from(e: NetworkError) -> Self {
        peernet_types::PeerNetError::NetworkError(e.to_string())
    }
}

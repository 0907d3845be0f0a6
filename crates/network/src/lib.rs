//! Peer network substrate: transports, connections, load exchange and confidential delivery.

pub mod confidential;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod network_load;
pub mod node;
pub mod request_response;
pub mod transport;

pub use confidential::{
    ConfidentialConfig, ConfidentialMessageService, ConfidentialPayload, DecryptedMessage,
    MessageListener, MessageSource, ProcessOutcome, SendConfidentialMessageResult,
};
pub use connection::{Connection, Direction};
pub use envelope::{EnvelopePayload, NetworkEnvelope, PROTOCOL_VERSION};
pub use error::{NetworkError, NetworkResult};
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot, TrafficTotals};
pub use network_load::{
    calculate_load, ExchangeConfig, LoadFactor, LoadInputs, LoadServiceConfig,
    NetworkLoadExchangeService, NetworkLoadService, NetworkLoadSnapshot, SnapshotState,
    LOAD_POLICY,
};
pub use node::{ListenerHandle, Node, NodeConfig, NodeEvent, NodeListener, NodeState};
pub use request_response::{CorrelatedRequests, PendingResponse, Resolution};
pub use transport::{
    FrameSink, FrameStream, Listening, MemoryNetwork, MemoryTransport, RawLink, TcpTransport,
    Transport, TransportRegistry,
};

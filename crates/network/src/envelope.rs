use crate::error::{NetworkError, NetworkResult};
use peernet_types::{
    Address, CloseReason, ConfidentialMessage, NetworkLoad, NetworkLoadExchangeRequest,
    NetworkLoadExchangeResponse,
};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Outermost unit carried over a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEnvelope {
    pub version: u32,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnvelopePayload {
    Handshake {
        address: Address,
        network_load: NetworkLoad,
    },
    HandshakeAck {
        address: Address,
        network_load: NetworkLoad,
    },
    CloseConnection {
        reason: CloseReason,
    },
    NetworkLoadExchangeRequest(NetworkLoadExchangeRequest),
    NetworkLoadExchangeResponse(NetworkLoadExchangeResponse),
    ConfidentialMessage(ConfidentialMessage),
    /// Opaque bytes of a higher layer protocol.
    Application(Vec<u8>),
}

impl EnvelopePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopePayload::Handshake { .. } => "Handshake",
            EnvelopePayload::HandshakeAck { .. } => "HandshakeAck",
            EnvelopePayload::CloseConnection { .. } => "CloseConnection",
            EnvelopePayload::NetworkLoadExchangeRequest(_) => "NetworkLoadExchangeRequest",
            EnvelopePayload::NetworkLoadExchangeResponse(_) => "NetworkLoadExchangeResponse",
            EnvelopePayload::ConfidentialMessage(_) => "ConfidentialMessage",
            EnvelopePayload::Application(_) => "Application",
        }
    }
}

impl NetworkEnvelope {
    pub fn new(payload: EnvelopePayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    pub fn to_bytes(&self) -> NetworkResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NetworkError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        let envelope: NetworkEnvelope = bincode::deserialize(bytes)
            .map_err(|e| NetworkError::DeserializationFailed(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(NetworkError::ProtocolViolation(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

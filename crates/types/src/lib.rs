use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerNetError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, PeerNetError>;

/// Network type a peer address belongs to. One transport serves each type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportType {
    Clear,
    Tor,
    I2p,
}

impl TransportType {
    pub fn all() -> [TransportType; 3] {
        [TransportType::Clear, TransportType::Tor, TransportType::I2p]
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Clear => write!(f, "CLEAR"),
            TransportType::Tor => write!(f, "TOR"),
            TransportType::I2p => write!(f, "I2P"),
        }
    }
}

impl FromStr for TransportType {
    type Err = PeerNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CLEAR" => Ok(TransportType::Clear),
            "TOR" => Ok(TransportType::Tor),
            "I2P" => Ok(TransportType::I2p),
            other => Err(PeerNetError::ConfigError(format!(
                "Unknown transport type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Onion and garlic hosts are routed over their overlay, everything else is clear net.
    pub fn transport_type(&self) -> TransportType {
        if self.host.ends_with(".onion") {
            TransportType::Tor
        } else if self.host.ends_with(".i2p") {
            TransportType::I2p
        } else {
            TransportType::Clear
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = PeerNetError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerNetError::InvalidAddress(format!("missing port in {}", s)))?;
        if host.is_empty() {
            return Err(PeerNetError::InvalidAddress(format!("missing host in {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| PeerNetError::InvalidAddress(format!("invalid port in {}: {}", s, e)))?;
        Ok(Address::new(host, port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn generate() -> Self {
        ConnectionId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a key bundle. Derived from the public key so it can travel
/// on the wire without leaking the key itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        KeyId(hex::encode(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        KeyId(s)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        KeyId(s.to_string())
    }
}

pub const DEFAULT_DIFFICULTY_ADJUSTMENT: f64 = 1.0;
pub const MIN_LOAD: f64 = 0.0;
pub const MAX_LOAD: f64 = 1.0;

/// Immutable load value of a node. `load` is always within [MIN_LOAD, MAX_LOAD].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NetworkLoad {
    load: f64,
    num_connections: i32,
    difficulty_adjustment_factor: f64,
}

impl NetworkLoad {
    pub fn new(load: f64, num_connections: i32) -> Self {
        Self::with_difficulty_adjustment(load, num_connections, DEFAULT_DIFFICULTY_ADJUSTMENT)
    }

    pub fn with_difficulty_adjustment(
        load: f64,
        num_connections: i32,
        difficulty_adjustment_factor: f64,
    ) -> Self {
        let load = if load.is_nan() {
            MIN_LOAD
        } else {
            load.clamp(MIN_LOAD, MAX_LOAD)
        };
        Self {
            load,
            num_connections: num_connections.max(0),
            difficulty_adjustment_factor,
        }
    }

    pub fn load(&self) -> f64 {
        self.load
    }

    pub fn num_connections(&self) -> i32 {
        self.num_connections
    }

    pub fn difficulty_adjustment_factor(&self) -> f64 {
        self.difficulty_adjustment_factor
    }

    /// Re-applies the invariants to a value that arrived from the wire.
    pub fn sanitized(self) -> Self {
        Self::with_difficulty_adjustment(
            self.load,
            self.num_connections,
            self.difficulty_adjustment_factor,
        )
    }
}

impl Default for NetworkLoad {
    fn default() -> Self {
        Self::new(MIN_LOAD, 0)
    }
}

impl fmt::Display for NetworkLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "load={:.4} connections={} difficulty={}",
            self.load, self.num_connections, self.difficulty_adjustment_factor
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkLoadExchangeRequest {
    pub nonce: i32,
    pub network_load: NetworkLoad,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkLoadExchangeResponse {
    pub request_nonce: i32,
    pub network_load: NetworkLoad,
}

/// Output of the hybrid encrypt-and-sign scheme. Opaque to everything but the crypto crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConfidentialData {
    pub sender_signing_key: [u8; 32],
    pub sender_encryption_key: [u8; 32],
    pub ephemeral_public_key: [u8; 32],
    pub nonce: [u8; 24],
    pub cipher_text: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConfidentialMessage {
    pub confidential_data: ConfidentialData,
    pub receiver_key_id: KeyId,
}

/// Retention metadata of a stored entry. Travels only on the storage wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MetaData {
    pub ttl_ms: u64,
    pub class_name: String,
    pub max_map_size: usize,
}

impl MetaData {
    pub const DEFAULT_MAX_MAP_SIZE: usize = 10_000;
    pub const TTL_10_DAYS_MS: u64 = 10 * 24 * 60 * 60 * 1000;

    pub fn new(ttl_ms: u64, class_name: impl Into<String>) -> Self {
        Self {
            ttl_ms,
            class_name: class_name.into(),
            max_map_size: Self::DEFAULT_MAX_MAP_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageDeliveryStatus {
    Sent,
    AddedToMailbox,
    Failed,
}

impl fmt::Display for MessageDeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDeliveryStatus::Sent => write!(f, "SENT"),
            MessageDeliveryStatus::AddedToMailbox => write!(f, "ADDED_TO_MAILBOX"),
            MessageDeliveryStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Shutdown,
    ClosedByPeer,
    DuplicateConnection,
    ReadFailed,
    WriteFailed,
    HandshakeFailed,
    ManuallyClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Shutdown => "SHUTDOWN",
            CloseReason::ClosedByPeer => "CLOSED_BY_PEER",
            CloseReason::DuplicateConnection => "DUPLICATE_CONNECTION",
            CloseReason::ReadFailed => "READ_FAILED",
            CloseReason::WriteFailed => "WRITE_FAILED",
            CloseReason::HandshakeFailed => "HANDSHAKE_FAILED",
            CloseReason::ManuallyClosed => "MANUALLY_CLOSED",
        };
        write!(f, "{}", s)
    }
}

impl From<serde_json::Error> for PeerNetError {
    fn from(e: serde_json::Error) -> Self {
        PeerNetError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr: Address = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(addr, Address::localhost(9000));
        assert_eq!(addr.transport_type(), TransportType::Clear);
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_address_transport_type() {
        let onion = Address::new("abcdef.onion", 1000);
        assert_eq!(onion.transport_type(), TransportType::Tor);

        let garlic = Address::new("peer.b32.i2p", 1000);
        assert_eq!(garlic.transport_type(), TransportType::I2p);
    }

    #[test]
    fn test_address_parse_rejects_garbage() {
        assert!("no-port".parse::<Address>().is_err());
        assert!(":9000".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_network_load_is_clamped() {
        assert_eq!(NetworkLoad::new(3.5, 4).load(), MAX_LOAD);
        assert_eq!(NetworkLoad::new(-1.0, 4).load(), MIN_LOAD);
        assert_eq!(NetworkLoad::new(f64::NAN, 4).load(), MIN_LOAD);
        assert_eq!(NetworkLoad::new(0.5, -3).num_connections(), 0);
    }

    #[test]
    fn test_network_load_sanitized_from_wire() {
        let raw: NetworkLoad = serde_json::from_str(
            r#"{"load":7.0,"num_connections":2,"difficulty_adjustment_factor":2.0}"#,
        )
        .unwrap();
        let load = raw.sanitized();
        assert_eq!(load.load(), MAX_LOAD);
        assert_eq!(load.difficulty_adjustment_factor(), 2.0);
    }

    #[test]
    fn test_transport_type_from_str() {
        assert_eq!("tor".parse::<TransportType>().unwrap(), TransportType::Tor);
        assert!("carrier-pigeon".parse::<TransportType>().is_err());
    }

    #[test]
    fn test_delivery_status_display() {
        assert_eq!(MessageDeliveryStatus::AddedToMailbox.to_string(), "ADDED_TO_MAILBOX");
    }
}

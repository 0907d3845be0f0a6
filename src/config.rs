use peernet_common::RateLimitConfig;
use peernet_network::{ConfidentialConfig, ExchangeConfig, LoadServiceConfig, NodeConfig};
use peernet_types::{Address, PeerNetError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeSection,
    pub network: NetworkSection,
    pub load: LoadSection,
    pub load_exchange: LoadExchangeSection,
    pub confidential: ConfidentialSection,
    pub rate_limit: RateLimitSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub listen_addr: String,
    pub data_dir: String,
    /// Tag of the key bundle used for confidential messages.
    pub key_id_tag: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            data_dir: "data".to_string(),
            key_id_tag: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub bootstrap_peers: Vec<String>,
    pub connect_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub event_channel_capacity: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bootstrap_peers: vec![],
            connect_timeout_ms: 10_000,
            max_frame_bytes: 10 * 1024 * 1024,
            event_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSection {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            initial_delay_secs: 15,
            interval_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadExchangeSection {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub max_idle_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LoadExchangeSection {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            interval_secs: 60,
            max_idle_secs: 300,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidentialSection {
    pub dispatch_channel_capacity: usize,
}

impl Default for ConfidentialSection {
    fn default() -> Self {
        Self {
            dispatch_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub max_per_second: usize,
    pub max_per_minute: usize,
    pub max_per_hour: usize,
    pub max_per_day: usize,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let limits = RateLimitConfig::default();
        Self {
            max_per_second: limits.max_per_second,
            max_per_minute: limits.max_per_minute,
            max_per_hour: limits.max_per_hour,
            max_per_day: limits.max_per_day,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, PeerNetError> {
        let mut app_config = AppConfig::default();

        // Try to load from file if exists
        if Path::new("config/default.toml").exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name("config/default"))
                .build()
                .map_err(|e| PeerNetError::ConfigError(format!("Failed to load config file: {}", e)))?;

            app_config = settings
                .try_deserialize::<AppConfig>()
                .map_err(|e| PeerNetError::ConfigError(format!("Invalid config file: {}", e)))?;
        }

        Self::override_from_env(&mut app_config)?;

        Ok(app_config)
    }

    fn override_from_env(config: &mut AppConfig) -> Result<(), PeerNetError> {
        if let Ok(listen_addr) = std::env::var("LISTEN_ADDR") {
            config.node.listen_addr = listen_addr;
        }

        if let Ok(key_id_tag) = std::env::var("KEY_ID_TAG") {
            config.node.key_id_tag = key_id_tag;
        }

        if let Ok(bootstrap_peers) = std::env::var("BOOTSTRAP_PEERS") {
            config.network.bootstrap_peers = split_peers(&bootstrap_peers);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.logging.format = format;
        }

        if let Ok(timeout) = std::env::var("LOAD_EXCHANGE_TIMEOUT_SECS") {
            config.load_exchange.timeout_secs = timeout.parse().map_err(|e| {
                PeerNetError::ConfigError(format!("Invalid LOAD_EXCHANGE_TIMEOUT_SECS: {}", e))
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), PeerNetError> {
        self.listen_addr()?;
        self.bootstrap_peers()?;

        if self.node.key_id_tag.is_empty() {
            return Err(PeerNetError::ConfigError("key_id_tag cannot be empty".to_string()));
        }

        for (name, value) in [
            ("network.connect_timeout_ms", self.network.connect_timeout_ms),
            ("network.max_frame_bytes", self.network.max_frame_bytes as u64),
            ("network.event_channel_capacity", self.network.event_channel_capacity as u64),
            ("load.interval_secs", self.load.interval_secs),
            ("load_exchange.interval_secs", self.load_exchange.interval_secs),
            ("load_exchange.timeout_secs", self.load_exchange.timeout_secs),
            ("confidential.dispatch_channel_capacity", self.confidential.dispatch_channel_capacity as u64),
        ] {
            if value == 0 {
                return Err(PeerNetError::ConfigError(format!("{} must be greater than 0", name)));
            }
        }

        let limits = &self.rate_limit;
        let windows = [
            ("max_per_second", limits.max_per_second),
            ("max_per_minute", limits.max_per_minute),
            ("max_per_hour", limits.max_per_hour),
            ("max_per_day", limits.max_per_day),
        ];
        if let Some((name, _)) = windows.iter().find(|(_, max)| *max == 0) {
            return Err(PeerNetError::ConfigError(format!(
                "rate_limit.{} must be greater than 0",
                name
            )));
        }
        for pair in windows.windows(2) {
            let ((narrow, narrow_max), (wide, wide_max)) = (pair[0], pair[1]);
            if wide_max < narrow_max {
                return Err(PeerNetError::ConfigError(format!(
                    "rate_limit.{} ({}) is below rate_limit.{} ({})",
                    wide, wide_max, narrow, narrow_max
                )));
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(PeerNetError::ConfigError(format!(
                "Unknown log format: {} (expected text or json)",
                other
            ))),
        }
    }

    pub fn listen_addr(&self) -> Result<Address, PeerNetError> {
        self.node
            .listen_addr
            .parse()
            .map_err(|e| PeerNetError::ConfigError(format!("Invalid listen_addr: {}", e)))
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<Address>, PeerNetError> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| PeerNetError::ConfigError(format!("Invalid bootstrap peer {}: {}", addr, e)))
            })
            .collect()
    }

    pub fn node_config(&self) -> Result<NodeConfig, PeerNetError> {
        Ok(NodeConfig {
            listen_address: self.listen_addr()?,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            event_channel_capacity: self.network.event_channel_capacity,
        })
    }

    pub fn load_service_config(&self) -> LoadServiceConfig {
        LoadServiceConfig {
            initial_delay: Duration::from_secs(self.load.initial_delay_secs),
            interval: Duration::from_secs(self.load.interval_secs),
        }
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            initial_delay: Duration::from_secs(self.load_exchange.initial_delay_secs),
            interval: Duration::from_secs(self.load_exchange.interval_secs),
            max_idle: Duration::from_secs(self.load_exchange.max_idle_secs),
            timeout: Duration::from_secs(self.load_exchange.timeout_secs),
        }
    }

    pub fn confidential_config(&self) -> ConfidentialConfig {
        ConfidentialConfig {
            dispatch_channel_capacity: self.confidential.dispatch_channel_capacity,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_per_second: self.rate_limit.max_per_second,
            max_per_minute: self.rate_limit.max_per_minute,
            max_per_hour: self.rate_limit.max_per_hour,
            max_per_day: self.rate_limit.max_per_day,
        }
    }
}

fn split_peers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

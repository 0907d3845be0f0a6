pub mod exchange;
pub mod service;
pub mod snapshot;

pub use exchange::{ExchangeConfig, NetworkLoadExchangeService};
pub use service::{calculate_load, LoadFactor, LoadInputs, LoadServiceConfig, NetworkLoadService, LOAD_POLICY};
pub use snapshot::{NetworkLoadSnapshot, SnapshotState};

//! Concurrency primitives shared by the network protocols.

pub mod clock;
pub mod rate_limiter;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerError, SchedulerResult};

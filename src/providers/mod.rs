pub mod rate_limit;
pub mod stats;

pub use rate_limit::{RateLimiter, RateLimits};
pub use stats::{SeasonStats, StatsClient};

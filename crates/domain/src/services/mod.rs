//! Shared service helpers such as rate limiting and telemetry wiring.

pub mod rate_limit;
pub mod telemetry;

pub use rate_limit::*;
pub use telemetry::*;

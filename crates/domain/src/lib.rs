//! Domain-level building blocks shared across the API and upstream crates.
//!
//! The gateway itself owns no business logic: this crate describes the
//! collaborator contracts it mounts, the data shapes those collaborators
//! exchange, and the environment contract every binary reads at startup.

pub mod capability;
pub mod config;
pub mod model;
pub mod services;

pub use capability::*;
pub use model::{EthAddress, OrderEvent, OrderEventKind, TransactionRecord, TransactionStatus};

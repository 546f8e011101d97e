//! # Backplane Core
//!
//! Provider-orchestration core for swappable backends: a registry of
//! heterogeneous provider adapters behind uniform capability interfaces, a
//! health monitor, a zero-downtime migration manager, and a unified service
//! facade with retry and circuit-breaker policy. Concrete adapters are
//! supplied externally; the core depends only on the interfaces in
//! [`traits`].

pub mod error;
pub mod events;
pub mod facade;
pub mod failover;
pub mod health;
pub mod migration;
pub mod orchestrator;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::*;
pub use events::*;
pub use facade::*;
pub use failover::*;
pub use health::*;
pub use migration::*;
pub use orchestrator::*;
pub use registry::*;
pub use traits::*;
pub use types::*;

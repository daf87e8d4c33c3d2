//! Nexus adapter implementations
//!
//! Adapters behind the nx-ports traits:
//! - `nats`: NATS pub/sub broker
//! - `memory`: in-memory broker, lock, and repositories for dev mode and tests
//! - `channel`: the per-channel fan-out engine (listener, delivery queue,
//!   worker pool, bounded subscriber queues)
//! - `postgres`: durable event store, event lock, and campaign repository
//! - `registry`: service-registration file loading
//! - `config`: campaign config file loading
//! - `retry`: redelivery worker for pending durable events

pub mod channel;
pub mod config;
pub mod memory;
pub mod nats;
pub mod postgres;
pub mod registry;
pub mod retry;

//! Nexus event router
//!
//! The routing core between client sessions and backend services:
//! - `bus`: per-action channel map with a default fallback channel
//! - `ingress`: validate, deduplicate, enrich, and route emitted events
//! - `multiplexer`: per-caller subscription fan-in with filters
//! - `campaign`: the stateful campaign aggregate with subscriber fan-out
//! - `grpc`: the tonic transport exposing EmitEvent / SubscribeEvents /
//!   RegisterPattern
//! - `config`: environment-driven service configuration

pub mod bus;
pub mod campaign;
pub mod config;
pub mod grpc;
pub mod ingress;
pub mod multiplexer;

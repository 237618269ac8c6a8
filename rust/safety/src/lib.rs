//! Mock flintlock-compatible microVM gRPC server.
//!
//! Holds microVM specs in memory so client code can be tested against the
//! `MicroVM` API without a virtualization backend.

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;

pub use error::{SafetyError, SafetyResult};
pub use server::{InMemoryConnector, SafetyServer};
pub use store::MicroVmStore;

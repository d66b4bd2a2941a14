//! # relwire-server
//!
//! TCP server for relwire.
//!
//! This crate provides:
//! - TCP connection handling with async I/O and an aux channel for events
//! - Per-connection handle tables and request dispatch to the engine
//! - An elastic worker pool that runs blocking engine calls
//! - SCRAM and legacy-hash authentication with login throttling
//! - Negotiated wire encryption
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod port;
pub mod registry;
pub mod server;

pub use auth::{AuthThrottle, UserStore};
pub use config::{
    AuthConfig, Config, CryptConfig, DatabaseConfig, EngineConfig, NetworkConfig, PoolConfig,
    UserSecret, WireCrypt,
};
pub use dispatch::Dispatcher;
pub use error::ServerError;
pub use metrics::Metrics;
pub use pool::WorkerPool;
pub use port::Port;
pub use registry::PortRegistry;
pub use server::Server;

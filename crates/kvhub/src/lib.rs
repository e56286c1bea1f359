//! # kvhub
//!
//! Named connection registry and lifecycle manager for RESP key-value stores.
//!
//! ## Overview
//!
//! An application declares its connections by logical name in a
//! [`ConfigSet`]. [`ConnectionRegistry::init`] opens one resilient [`Client`]
//! per name and returns a [`DefaultRouter`], which forwards every operation to
//! whichever handle is currently registered as `default`.
//!
//! Every handle uses the same [`ResiliencePolicy`]:
//! 1. Reconnect delay grows by 100ms per attempt, capped at 5s
//! 2. Reconnect attempts are unbounded
//! 3. Requests issued while offline are queued
//! 4. A request fails once it has been retried more than 3 times
//!
//! ## Signals
//!
//! - `SIGINT` / `SIGTERM`: close every connection, then exit (see
//!   [`register_shutdown_hooks`])
//!
//! ## Environment Variables
//!
//! - `KVHUB_HOST`, `KVHUB_PORT`, `KVHUB_PASSWORD`: override the `default`
//!   connection
//! - `KVHUB_LOG_LEVEL`: override the configured log level
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS) for signal handling.

#[cfg(not(unix))]
compile_error!("kvhub requires a Unix platform (Linux or macOS)");

mod client;
mod commands;
pub mod config;
mod error;
mod factory;
mod lifecycle;
mod policy;
mod registry;
pub mod resp;
mod router;
mod transport;

pub use client::{Client, ClientEvent, ConnectionState};
pub use commands::{command_from_parts, is_supported, Commands, SUPPORTED_COMMANDS};
pub use config::{
    load_config_from, load_config_from_str, Config, ConfigError, ConfigSet, ConnectionOptions,
    LoggingConfig, DEFAULT_CONNECTION,
};
pub use error::{ClientError, RegistryError};
pub use factory::ClientFactory;
pub use lifecycle::{register_shutdown_hooks, ShutdownHooks, TerminationSignal};
pub use policy::{ResiliencePolicy, MAX_RECONNECT_DELAY, MAX_RETRIES_PER_REQUEST, RECONNECT_STEP};
pub use registry::{ConnectionHealth, ConnectionRegistry, RegistryHealth, RegistryStatus};
pub use resp::{Command, FromValue, RespCodec, ToArg, Value};
pub use router::DefaultRouter;
pub use transport::{Connector, TcpConnector, Transport};

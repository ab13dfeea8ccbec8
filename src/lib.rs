//! melp - Kafka to HTTP bridge library
//!
//! Producers publish HTTP request bodies onto topics; receivers consume
//! topics through consumer groups and forward every message to an HTTP
//! callback with at-least-once delivery.
//!
//! # Architecture
//!
//! - `config`: YAML configuration with environment substitution
//! - `endpoint`: broker endpoint descriptors and security settings
//! - `broker`: the [`broker::Transport`] seam with Kafka and in-memory backends
//! - `producer` / `receiver`: the two unit kinds
//! - `callback`: outbound HTTP delivery with retry
//! - `registry`: wiring from configuration to live units
//! - `server`: the axum HTTP surface
//!
//! # Example
//!
//! ```no_run
//! use melp::config::{Config, LoadOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("melp.yaml", LoadOptions::default())?;
//!     config.validate().map_err(|e| anyhow::anyhow!("{:?}", e))?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod callback;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod receiver;
pub mod registry;
pub mod retry;
pub mod server;

pub use config::Config;
pub use error::Result;
pub use message::Message;
pub use registry::Registry;

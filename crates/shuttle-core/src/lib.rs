//! shuttle-core
//!
//! Queueing and dispatching engine for content distribution agents.
//!
//! # Modules
//! - **domain**: queue items, entries, statuses, distribution requests
//! - **ports**: stores, packages, credentials and queue consumers as traits
//! - **queue**: the queue contract, its backends (transient, persisted, tree) and decorators
//! - **dispatch**: strategies choosing the queues a package goes to
//! - **transport**: HTTP delivery and pull
//! - **app**: provider, processing loops, agent wiring
//! - **impls**: in-memory implementations of the ports
//! - **config**: TOML agent configuration

pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod transport;

pub use self::error::{Result, ShuttleError};

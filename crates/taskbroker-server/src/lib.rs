//! Task Broker Library
//!
//! Admits script tasks from clients, offers them to registered runner
//! processes, and supervises them until they finish: runner liveness,
//! execution deadlines, cancellation and the deferred queue.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod state;
pub mod transport;

pub use broker::{Broker, RunnerHandle};
pub use config::Config;
pub use error::{BrokerError, ConfigError, TransportError};
pub use events::{HeartbeatFailure, LifecycleEvent};
pub use state::{BrokerStats, RunnerSnapshot};

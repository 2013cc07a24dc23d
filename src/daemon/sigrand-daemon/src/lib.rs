//! Sigrand Daemon Library
//!
//! Serves one randomly chosen signature to every reader of a named pipe

pub mod config;
pub mod daemon;
pub mod metrics;

pub use config::{ConfigManager, DaemonConfig};
pub use daemon::{Daemon, LifecycleState};
pub use metrics::{ServeStats, StatsSnapshot};

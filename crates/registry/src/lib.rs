//! Registry of Chrome processes launched by cdpctl.
//!
//! [`ChromeRegistry`] owns a fixed number of instance slots, hands out ids and
//! debug ports, stops processes with `SIGTERM`/`SIGKILL` escalation and checks
//! their health. [`HealthMonitor`] runs the check on a timer.

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod model;
pub mod process;
pub mod spawn;
pub mod state;

pub use config::RegistryConfig;
pub use errors::{RegistryError, RegistryResult};
pub use health::HealthMonitor;
pub use model::{
    ChromeInstance, HealthFailure, InstanceConfig, InstanceStatus, RegistryStats,
};
pub use spawn::{instance_launch_args, ChromeSpawner, CommandSpawner, ProcessSpawner};
pub use state::{ChromeRegistry, HealthCallback, RecoveryCallback};

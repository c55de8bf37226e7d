//! cdpctl: a command-line and HTTP companion for Chrome DevTools Protocol.
//!
//! The protocol plumbing lives in `cdp-adapter`, process bookkeeping in
//! `cdpctl-registry` and task execution in `cdpctl-scheduler`. This crate
//! wires them together behind [`app_context::AppContext`], the clap CLI in
//! [`cli`] and the axum control API in [`server`].

pub mod app_context;
pub mod cli;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;
pub mod task_handler;

pub use app_context::{AppContext, ContextStats};
pub use config::{AppConfig, HttpConfig, LoadedConfig};
pub use errors::{AppError, AppResult};
pub use task_handler::{CdpTaskHandler, CDP_TASK_TYPE};

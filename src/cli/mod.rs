pub mod app;
pub mod cdp;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod env;
pub mod instances;
pub mod output;
pub mod runtime;
pub mod serve;
pub mod tasks;

pub use app::run;
pub use env::{CliArgs, LogFormat};
pub use output::OutputFormat;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use super::commands::Commands;
use super::output::OutputFormat;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human, global = true)]
    pub output: OutputFormat,

    /// Metrics server port (set to 0 to disable)
    #[arg(long, default_value_t = 0, global = true)]
    pub metrics_port: u16,

    #[command(subcommand)]
    pub command: Commands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands::{Commands, InstancesAction};
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parses_call_with_params_and_timeout() {
        let cli = CliArgs::try_parse_from([
            "cdpctl",
            "--log-format",
            "json",
            "call",
            "Runtime.evaluate",
            r#"{"expression":"1+1"}"#,
            "--timeout",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.method, "Runtime.evaluate");
                assert_eq!(args.timeout, 250);
                assert!(args.params.is_some());
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn parses_instance_kill() {
        let cli = CliArgs::try_parse_from(["cdpctl", "instances", "kill", "4", "--force"]).unwrap();
        match cli.command {
            Commands::Instances(args) => match args.action {
                InstancesAction::Kill { id, force } => {
                    assert_eq!(id, 4);
                    assert!(force);
                }
                _ => panic!("expected kill"),
            },
            _ => panic!("expected instances"),
        }
    }
}

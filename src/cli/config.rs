use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::output::{print_value, OutputFormat};
use crate::config::{parse_config_file, AppConfig};

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file, defaults and environment merged)
    Show,

    /// Parse and check the configuration file
    Validate,

    /// Print which configuration file is in effect
    Path,
}

pub fn cmd_config(
    args: ConfigArgs,
    config: &AppConfig,
    path: &Path,
    from_file: bool,
    output: OutputFormat,
) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            if output == OutputFormat::Human {
                println!("# {}", describe_source(path, from_file));
                print!("{}", serde_yaml::to_string(config)?);
            } else {
                print_value(output, config)?;
            }
        }
        ConfigAction::Validate => {
            if from_file {
                let parsed = parse_config_file(path)?;
                parsed
                    .validate()
                    .with_context(|| format!("validating {}", path.display()))?;
                println!("Configuration file {} is valid", path.display());
            } else {
                config.validate()?;
                println!(
                    "No configuration file at {}; defaults are valid",
                    path.display()
                );
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}

fn describe_source(path: &Path, from_file: bool) -> String {
    if from_file {
        format!("loaded from {}", path.display())
    } else {
        format!("defaults ({} not found)", path.display())
    }
}

use std::sync::Arc;

use anyhow::Result;

use super::cdp::{cmd_call, cmd_ensure, cmd_new_page, cmd_send, cmd_targets};
use super::config::cmd_config;
use super::env::CliArgs;
use super::instances::cmd_instances;
use super::serve::cmd_serve;
use super::tasks::cmd_tasks;
use crate::app_context::AppContext;
use crate::cli::commands::Commands;
use crate::config::LoadedConfig;

pub async fn dispatch(cli: &CliArgs, loaded: LoadedConfig) -> Result<()> {
    let output = cli.output;
    let LoadedConfig {
        config,
        path,
        from_file,
    } = loaded;

    if let Commands::Config(args) = &cli.command {
        return cmd_config(args.clone(), &config, &path, from_file, output);
    }
    if let Commands::Instances(args) = &cli.command {
        return cmd_instances(args.clone(), &config, output).await;
    }

    config.validate()?;
    let ctx = Arc::new(AppContext::new(config));
    match cli.command.clone() {
        Commands::Call(args) => cmd_call(args, &ctx, output).await,
        Commands::Send(args) => cmd_send(args, &ctx, output).await,
        Commands::Ensure { relaunch } => cmd_ensure(relaunch, &ctx, output).await,
        Commands::Targets => cmd_targets(&ctx, output).await,
        Commands::NewPage => cmd_new_page(&ctx, output).await,
        Commands::Tasks(args) => cmd_tasks(args, &ctx, output).await,
        Commands::Serve(args) => cmd_serve(args, ctx).await,
        Commands::Config(_) | Commands::Instances(_) => Ok(()),
    }
}

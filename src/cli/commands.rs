use clap::{Args, Subcommand};

use super::config::ConfigArgs;
use super::serve::ServeArgs;
use super::tasks::TasksArgs;

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Send a CDP command and print the reply
    Call(CallArgs),

    /// Send a CDP command without waiting for the reply
    Send(SendArgs),

    /// Make sure Chrome is listening on the debug port
    Ensure {
        /// Close the running browser and start a fresh one
        #[arg(long)]
        relaunch: bool,
    },

    /// List DevTools targets
    Targets,

    /// Open a blank page and print its target id
    NewPage,

    /// Manage browser instances held by a running `cdpctl serve`
    Instances(InstancesArgs),

    /// Run a batch of tasks over a pool of launched instances
    Tasks(TasksArgs),

    /// Run the HTTP control API
    Serve(ServeArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
pub struct CallArgs {
    /// CDP method, e.g. Page.navigate
    pub method: String,

    /// Parameters as a JSON object
    pub params: Option<String>,

    /// Reply timeout in milliseconds (0 uses the configured default)
    #[arg(long, default_value_t = 0)]
    pub timeout: i64,
}

#[derive(Args, Clone, Debug)]
pub struct SendArgs {
    /// CDP method, e.g. Page.reload
    pub method: String,

    /// Parameters as a JSON object
    pub params: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct InstancesArgs {
    /// Base URL of the control API (defaults to the configured http bind/port)
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub action: InstancesAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum InstancesAction {
    /// Launch new instances with the registry defaults
    Launch {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// List registered instances
    List,

    /// Stop an instance
    Kill {
        id: u32,

        /// Skip SIGTERM and kill immediately
        #[arg(long)]
        force: bool,
    },

    /// Registry and scheduler counters
    Stats,
}

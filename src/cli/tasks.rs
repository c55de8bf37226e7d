use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use cdpctl_scheduler::{Priority, Task};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::output::{print_value, OutputFormat};
use super::runtime::blocking;
use crate::app_context::AppContext;
use crate::task_handler::CDP_TASK_TYPE;

#[derive(Args, Clone, Debug)]
pub struct TasksArgs {
    #[command(subcommand)]
    pub action: TasksAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum TasksAction {
    /// Launch instances, run every task in FILE, print the outcomes, clean up
    Run {
        /// JSON array of `{"type", "data", "priority"}` objects
        file: PathBuf,

        /// Browser instances to launch for the pool
        #[arg(long, default_value_t = 2)]
        instances: u32,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
}

/// One entry of a batch file. `type` defaults to `cdp`.
#[derive(Clone, Debug, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Priority,
}

fn default_task_type() -> String {
    CDP_TASK_TYPE.to_string()
}

#[derive(Debug, Serialize)]
struct BatchReport {
    finished: bool,
    tasks: Vec<Task>,
    metrics: cdpctl_scheduler::SchedulerMetrics,
}

pub fn parse_batch(raw: &str) -> Result<Vec<TaskSpec>> {
    let specs: Vec<TaskSpec> = serde_json::from_str(raw).context("batch file must be a JSON array of tasks")?;
    if specs.is_empty() {
        bail!("batch file contains no tasks");
    }
    Ok(specs)
}

pub async fn cmd_tasks(args: TasksArgs, ctx: &Arc<AppContext>, output: OutputFormat) -> Result<()> {
    match args.action {
        TasksAction::Run {
            file,
            instances,
            wait_secs,
        } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let specs = parse_batch(&raw)?;
            let result = blocking(ctx, move |ctx| {
                run_batch(ctx, specs, instances, Duration::from_secs(wait_secs))
            })
            .await;
            let cleanup = Arc::clone(ctx);
            tokio::task::spawn_blocking(move || cleanup.shutdown()).await?;
            let report = result?;
            print_value(output, &report)?;
            if !report.finished {
                bail!("tasks still pending after {wait_secs}s");
            }
            Ok(())
        }
    }
}

fn run_batch(
    ctx: &AppContext,
    specs: Vec<TaskSpec>,
    instances: u32,
    wait: Duration,
) -> Result<BatchReport> {
    if instances == 0 {
        bail!("--instances must be at least 1");
    }
    for _ in 0..instances {
        let instance = ctx.launch_instance(None)?;
        info!(instance = instance.instance_id, port = instance.debug_port, "instance ready");
    }
    ctx.start_health_monitor()?;
    let scheduler = ctx.start_scheduler()?;

    let mut ids = Vec::with_capacity(specs.len());
    for spec in specs {
        ids.push(scheduler.submit_task(spec.task_type, spec.data, spec.priority)?);
    }
    info!(tasks = ids.len(), "batch submitted");

    let finished = scheduler.wait_for_all_tasks(wait);
    if !finished {
        warn!(pending = scheduler.queue_len(), "batch did not finish in time");
    }
    let tasks = ids
        .iter()
        .filter_map(|id| scheduler.get_task(*id).ok())
        .collect();
    Ok(BatchReport {
        finished,
        tasks,
        metrics: scheduler.metrics(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_entries_default_to_cdp_normal() {
        let specs = parse_batch(
            r#"[
                {"data": {"method": "Page.navigate", "params": {"url": "https://example.com"}}},
                {"type": "stub", "priority": "high"}
            ]"#,
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].task_type, "cdp");
        assert_eq!(specs[0].priority, Priority::Normal);
        assert_eq!(specs[1].task_type, "stub");
        assert_eq!(specs[1].priority, Priority::High);
        assert!(specs[1].data.is_null());
    }

    #[test]
    fn empty_or_malformed_batches_are_rejected() {
        assert!(parse_batch("[]").is_err());
        assert!(parse_batch(r#"{"type": "cdp"}"#).is_err());
    }
}

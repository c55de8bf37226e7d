use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TaskId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn weight(self) -> u8 {
        match self {
            Priority::Critical => 8,
            Priority::High => 4,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// How the pool picks an instance for the next task.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    BestPerformance,
    Random,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            "best_performance" => Ok(Strategy::BestPerformance),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// Snapshot of a task as held by the scheduler.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub data: Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub instance_id: Option<u32>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, task_type: String, data: Value, priority: Priority) -> Self {
        Self {
            id,
            task_type,
            data,
            priority,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            instance_id: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub strategy: Strategy,
    pub max_retries: u32,
    pub task_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1000,
            strategy: Strategy::RoundRobin,
            max_retries: 3,
            task_timeout_ms: 30_000,
        }
    }
}

/// Aggregate counters for one scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SchedulerMetrics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub average_response_ms: f64,
    pub throughput_per_sec: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strategy_names() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("LEAST_LOADED".parse::<Strategy>().unwrap(), Strategy::LeastLoaded);
        assert!("fastest".parse::<Strategy>().is_err());
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"strategy": "best_performance"}"#).unwrap();
        assert_eq!(config.strategy, Strategy::BestPerformance);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn final_states() {
        assert!(TaskStatus::Cancelled.is_final());
        assert!(!TaskStatus::Retrying.is_final());
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
    }
}

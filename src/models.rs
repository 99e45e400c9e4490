//! Core data models for relayflow

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// Input validation limits for declarative workflows
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NODE_COUNT: usize = 1_000;
pub const MAX_NODE_NAME_LEN: usize = 64;
pub const MAX_COMMAND_LEN: usize = 4_096; // 4 KB
pub const MAX_ARG_COUNT: usize = 256;
pub const MAX_ARG_LEN: usize = 4_096; // 4 KB
pub const MAX_OUTPUT_SIZE: usize = 10_485_760; // 10 MB

/// Execution state of a single node. Transitions are monotonic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a completed node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Success,
    Failed(String),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success)
    }
}

/// Coarse status of a whole flow, derived from its nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    /// The ready set is non-empty, another round would run something
    Running,
    /// Every node completed successfully
    Succeeded,
    /// Nothing is ready but some node failed or can never become ready
    Stalled,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::Running => write!(f, "running"),
            FlowStatus::Succeeded => write!(f, "succeeded"),
            FlowStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// Job state label persisted by a job store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Stalled,
    /// The job could not be restored or persisted and needs an operator
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Stalled => "stalled",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Stalled | JobState::Failed
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "stalled" => Ok(JobState::Stalled),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("unknown job state: {}", s)),
        }
    }
}

impl From<FlowStatus> for JobState {
    fn from(status: FlowStatus) -> Self {
        match status {
            FlowStatus::Running => JobState::Running,
            FlowStatus::Succeeded => JobState::Succeeded,
            FlowStatus::Stalled => JobState::Stalled,
        }
    }
}

/// Declarative workflow parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub config: WorkflowGlobalConfig,
    pub nodes: Vec<NodeConfig>,
}

/// Global workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGlobalConfig {
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for WorkflowGlobalConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_max_output_bytes() -> usize {
    MAX_OUTPUT_SIZE
}

/// A node of a declarative workflow: a local command plus its data contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub shell: ShellConfig,
    /// Data store keys exported to the command as environment variables
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Data store key receiving trimmed stdout, defaults to the node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl NodeConfig {
    pub fn output_key(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }
}

/// Shell executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub command: String, // Absolute path to binary
    #[serde(default)]
    pub args: Vec<String>, // Arguments as list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>, // Working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>, // Environment variables
}

/// Result of a shell command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration: Duration,
    #[serde(default)]
    pub output_truncated: bool,
}

/// Job loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_batch_size() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

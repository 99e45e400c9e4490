//! Build flows from declarative workflow definitions
//!
//! Every workflow node becomes a flow node whose callback runs a local
//! command. Declared inputs are exported to the child as environment
//! variables and trimmed stdout is staged under the node's output key.

use crate::error::Result;
use crate::executors::ShellExecutor;
use crate::flow::Flow;
use crate::models::{ShellConfig, WorkflowConfig};
use crate::node::NodeContext;
use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Build a flow with one shell node per workflow node
pub fn build_flow(config: &WorkflowConfig) -> Result<Flow> {
    let executor = ShellExecutor::new(config.config.max_output_bytes);
    let mut flow = Flow::new(config.name.clone());

    for node in &config.nodes {
        let shell_node = Arc::new(ShellNode {
            shell: node.shell.clone(),
            inputs: node.inputs.clone(),
            output: node.output_key().to_string(),
            executor: executor.clone(),
        });
        let deps: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();

        flow.node(node.name.clone(), &deps, move |ctx| {
            let shell_node = shell_node.clone();
            async move { shell_node.run(ctx).await }
        })?;
    }

    Ok(flow)
}

/// Environment variable a data key is exported as
pub fn env_var_name(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn env_var_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct ShellNode {
    shell: ShellConfig,
    inputs: Vec<String>,
    output: String,
    executor: ShellExecutor,
}

impl ShellNode {
    async fn run(&self, ctx: NodeContext) -> anyhow::Result<()> {
        let mut env = Vec::with_capacity(self.inputs.len());
        for key in &self.inputs {
            let value: Value = ctx
                .input(key)
                .with_context(|| format!("input '{}' is not available", key))?;
            env.push((env_var_name(key), env_var_value(&value)));
        }

        let result = self
            .executor
            .execute(&self.shell, &env, ctx.cancellation())
            .await?;

        if !result.success {
            let status = match result.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            anyhow::bail!("command failed with {}: {}", status, result.stderr.trim());
        }

        debug!(
            "Node '{}' finished in {:?}, writing '{}'",
            ctx.key(),
            result.duration,
            self.output
        );
        ctx.output(self.output.clone(), result.stdout.trim())?;
        Ok(())
    }
}

//! YAML parser with validation for declarative workflows

use crate::dag::DependencyGraph;
use crate::error::{FlowError, Result};
use crate::models::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a workflow from a YAML file.
///
/// Enforces the same limits as [`parse_workflow_yaml`].
///
/// # Example
///
/// ```no_run
/// use relayflow::parser::parse_workflow_file;
///
/// let config = parse_workflow_file("deploy.yaml")?;
/// println!("Loaded workflow: {}", config.name);
/// # Ok::<(), relayflow::error::FlowError>(())
/// ```
pub fn parse_workflow_file<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig> {
    let content = fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Parse a workflow from a YAML string.
///
/// - YAML must be <= 1MB
/// - at most 1,000 nodes, names alphanumeric plus `_`/`-`, unique
/// - every dependency names a node of the workflow, no cycles
/// - commands are absolute paths within the argument limits
///
/// # Example
///
/// ```
/// use relayflow::parser::parse_workflow_yaml;
///
/// let yaml = r#"
/// name: deploy
/// nodes:
///   - name: build
///     command: "/bin/echo"
///     args: ["build-233"]
///     output: artifact-id
/// "#;
///
/// let config = parse_workflow_yaml(yaml)?;
/// assert_eq!(config.name, "deploy");
/// # Ok::<(), relayflow::error::FlowError>(())
/// ```
pub fn parse_workflow_yaml(content: &str) -> Result<WorkflowConfig> {
    if content.len() > MAX_YAML_SIZE {
        return Err(FlowError::YamlSizeExceeded(content.len()));
    }

    let config: WorkflowConfig = serde_yaml::from_str(content)?;

    validate_node_name(&config.name)?;

    if config.nodes.len() > MAX_NODE_COUNT {
        return Err(FlowError::NodeCountExceeded {
            count: config.nodes.len(),
            limit: MAX_NODE_COUNT,
        });
    }

    {
        let mut seen_names = HashSet::with_capacity(config.nodes.len());
        for node in &config.nodes {
            validate_node_name(&node.name)?;
            if !seen_names.insert(&node.name) {
                return Err(FlowError::Validation(format!(
                    "Duplicate node name '{}'",
                    node.name,
                )));
            }
        }
    }

    for node in &config.nodes {
        validate_shell_config(&node.shell)?;
        validate_data_keys(node)?;
    }

    validate_dependencies(&config)?;

    DependencyGraph::build(
        config
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), n.depends_on.as_slice())),
    )?;

    if config.config.max_output_bytes == 0 {
        return Err(FlowError::Validation(
            "max_output_bytes must be at least 1".to_string(),
        ));
    }

    Ok(config)
}

/// Validate node name format and length
fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FlowError::InvalidNodeName {
            name: name.to_string(),
        });
    }

    if name.len() > MAX_NODE_NAME_LEN {
        return Err(FlowError::NodeNameTooLong {
            name: name.to_string(),
            max: MAX_NODE_NAME_LEN,
        });
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(FlowError::InvalidNodeName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Input and output keys must be usable as data store keys
fn validate_data_keys(node: &NodeConfig) -> Result<()> {
    let blank_input = node.inputs.iter().any(|k| k.trim().is_empty());
    let blank_output = node.output.as_deref().is_some_and(|k| k.trim().is_empty());

    if blank_input || blank_output {
        return Err(FlowError::Validation(format!(
            "Node '{}' declares an empty data key",
            node.name
        )));
    }

    Ok(())
}

/// Validate that all dependencies reference existing nodes
fn validate_dependencies(config: &WorkflowConfig) -> Result<()> {
    let names: HashSet<_> = config.nodes.iter().map(|n| &n.name).collect();

    for node in &config.nodes {
        for dep in &node.depends_on {
            if !names.contains(dep) {
                return Err(FlowError::MissingDependency {
                    node: node.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Validate shell executor configuration.
///
/// - Command must be an absolute path no longer than the command limit
/// - Argument count and each argument's length are bounded
/// - Working directory must be absolute with no `..` traversal
///
/// # Example
///
/// ```
/// use relayflow::parser::validate_shell_config;
/// use relayflow::models::ShellConfig;
///
/// let config = ShellConfig {
///     command: "/bin/echo".to_string(),
///     args: vec!["hello".to_string()],
///     workdir: Some("/tmp".to_string()),
///     env: None,
/// };
///
/// validate_shell_config(&config)?;
/// # Ok::<(), relayflow::error::FlowError>(())
/// ```
pub fn validate_shell_config(config: &ShellConfig) -> Result<()> {
    if config.command.len() > MAX_COMMAND_LEN {
        return Err(FlowError::CommandTooLong {
            limit: MAX_COMMAND_LEN,
        });
    }

    if !config.command.starts_with('/') {
        return Err(FlowError::InvalidPath(
            "Command must be an absolute path".to_string(),
        ));
    }

    if config.args.len() > MAX_ARG_COUNT {
        return Err(FlowError::ArgCountExceeded {
            count: config.args.len(),
            limit: MAX_ARG_COUNT,
        });
    }

    for arg in &config.args {
        if arg.len() > MAX_ARG_LEN {
            return Err(FlowError::ArgTooLong { limit: MAX_ARG_LEN });
        }
    }

    if let Some(workdir) = &config.workdir {
        validate_path(workdir)?;
    }

    Ok(())
}

/// Validate a filesystem path: absolute and free of `..`
///
/// # Example
///
/// ```
/// use relayflow::parser::validate_path;
///
/// validate_path("/tmp")?;
/// validate_path("/usr/bin/ls")?;
/// assert!(validate_path("/tmp/../etc").is_err());
/// # Ok::<(), relayflow::error::FlowError>(())
/// ```
pub fn validate_path(path: &str) -> Result<()> {
    if path.contains("..") {
        return Err(FlowError::PathTraversal(path.to_string()));
    }

    if !path.starts_with('/') {
        return Err(FlowError::InvalidPath("Path must be absolute".to_string()));
    }

    Ok(())
}

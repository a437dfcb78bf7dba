//! TOML workflow definitions.
//!
//! ```toml
//! name = "report"
//!
//! [[nodes]]
//! id = "load"
//! task_name = "load-data"
//! payload = { value = 21 }
//!
//! [[nodes]]
//! id = "double"
//! task_name = "double"
//! priority = 2
//! dependencies = ["load"]
//! payload = { use_output_from = "load" }
//! ```

use serde::Deserialize;
use std::path::Path;
use taskmesh_core::{Payload, TaskmeshError, TaskmeshResult};
use taskmesh_orchestrator::{GraphNode, GraphWorkflow, Priority};

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    id: String,
    task_name: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    payload: Option<toml::Value>,
}

/// Parse and validate a workflow definition.
pub fn parse(raw: &str) -> TaskmeshResult<GraphWorkflow> {
    let file: WorkflowFile = toml::from_str(raw)
        .map_err(|e| TaskmeshError::InvalidArgument(format!("invalid workflow file: {e}")))?;

    let mut workflow = GraphWorkflow::new(file.name);
    for entry in file.nodes {
        let payload = match entry.payload {
            Some(value) => serde_json::to_value(value)?,
            None => Payload::Object(serde_json::Map::new()),
        };
        let mut node = GraphNode::new(entry.id, entry.task_name, payload).depends_on(entry.dependencies);
        if let Some(level) = entry.priority {
            node = node.with_priority(Priority::try_from(level)?);
        }
        workflow.add_node(node)?;
    }
    workflow.validate()?;
    Ok(workflow)
}

pub fn load(path: &Path) -> TaskmeshResult<GraphWorkflow> {
    let raw = std::fs::read_to_string(path)?;
    parse(&raw)
}

//! Mermaid diagram generation for workflows
//!
//! # Node Shapes
//!
//! | Executor            | Shape        | Mermaid Syntax  |
//! |---------------------|--------------|-----------------|
//! | Start executor      | Stadium      | `id([label])`   |
//! | Output executor     | Subroutine   | `id[[label]]`   |
//! | Other executors     | Rectangle    | `id[label]`     |
//! | Fan-in barrier      | Circle       | `id((label))`   |

use super::edge::Edge;
use super::executor::ExecutorId;
use super::graph::Workflow;

// ============================================================================
// ID Sanitization
// ============================================================================

/// Sanitize an executor ID for use as a Mermaid node identifier.
///
/// Mermaid node IDs must be alphanumeric (plus underscores).
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ============================================================================
// Node Rendering
// ============================================================================

/// Render an executor node with a shape reflecting its role.
pub fn render_node(id: &ExecutorId, is_start: bool, is_output: bool) -> String {
    let safe_id = sanitize_id(id.as_str());
    let label = id.as_str();

    if is_start {
        format!("    {}([{}])", safe_id, label)
    } else if is_output {
        format!("    {}[[{}]]", safe_id, label)
    } else {
        format!("    {}[{}]", safe_id, label)
    }
}

// ============================================================================
// Edge Rendering
// ============================================================================

/// Render an edge between two nodes.
///
/// - Unconditional edges: solid arrow `-->`
/// - Conditional edges: dotted arrow with label `-. "label" .->`
pub fn render_edge(from: &str, to: &str, condition: Option<&str>) -> String {
    let from_safe = sanitize_id(from);
    let to_safe = sanitize_id(to);

    match condition {
        Some(label) => format!("    {} -. \"{}\" .-> {}", from_safe, label, to_safe),
        None => format!("    {} --> {}", from_safe, to_safe),
    }
}

impl Workflow {
    /// Render the workflow graph as a Mermaid flowchart
    ///
    /// Fan-in edges go through a barrier node named after the edge id, so
    /// the diagram shows that the sink waits for all sources.
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];

        for id in self.executor_ids() {
            lines.push(render_node(
                id,
                id == self.start_executor_id(),
                self.is_output_executor(id),
            ));
        }

        for edge in self.edges() {
            match edge {
                Edge::Direct(data) => {
                    let label = data
                        .label
                        .as_deref()
                        .or(data.condition.as_ref().map(|_| "condition"));
                    lines.push(render_edge(data.source.as_str(), data.sink.as_str(), label));
                }
                Edge::FanOut(data) => {
                    let label = data.assigner.as_ref().map(|_| "partition");
                    for sink in &data.sinks {
                        lines.push(render_edge(data.source.as_str(), sink.as_str(), label));
                    }
                }
                Edge::FanIn(data) => {
                    let barrier = sanitize_id(data.id.as_str());
                    lines.push(format!("    {}((join))", barrier));
                    for source in &data.sources {
                        lines.push(render_edge(source.as_str(), &barrier, None));
                    }
                    lines.push(render_edge(&barrier, data.sink.as_str(), None));
                }
            }
        }

        lines.join("\n")
    }
}

// ============================================================================
// Tests
// ============================================================================

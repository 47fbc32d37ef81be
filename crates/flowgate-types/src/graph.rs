//! The stored pipeline graph: inputs, transformations, outputs and the flows between them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a stored pipeline. A run is keyed by the pipeline it executes.
pub type PipelineId = i64;

/// Advisory field-name → type-name mapping attached to nodes.
pub type Schema = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Transformation,
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Transformation => "transformation",
            NodeKind::Output => "output",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reference to one node of a pipeline graph.
///
/// Ordering is by kind first (inputs, then transformations, then outputs) and
/// then by id, so `NodeRef` can key ordered maps directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Input(i64),
    Transformation(i64),
    Output(i64),
}

impl NodeRef {
    pub fn new(kind: NodeKind, id: i64) -> Self {
        match kind {
            NodeKind::Input => NodeRef::Input(id),
            NodeKind::Transformation => NodeRef::Transformation(id),
            NodeKind::Output => NodeRef::Output(id),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRef::Input(_) => NodeKind::Input,
            NodeRef::Transformation(_) => NodeKind::Transformation,
            NodeRef::Output(_) => NodeKind::Output,
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            NodeRef::Input(id) | NodeRef::Transformation(id) | NodeRef::Output(id) => id,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind(), self.id())
    }
}

// ---------------------------------------------------------------------------
// Node records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputNode {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub topic: String,
    pub broker_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNode {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub topic: String,
    pub broker_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationNode {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_in: Option<Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_out: Option<Schema>,
}

/// A directed edge between two nodes, stored flat as the graph store returns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub start_kind: NodeKind,
    pub start_id: i64,
    pub end_kind: NodeKind,
    pub end_id: i64,
}

impl Flow {
    pub fn new(start: NodeRef, end: NodeRef) -> Self {
        Self {
            id: None,
            start_kind: start.kind(),
            start_id: start.id(),
            end_kind: end.kind(),
            end_id: end.id(),
        }
    }

    pub fn start(&self) -> NodeRef {
        NodeRef::new(self.start_kind, self.start_id)
    }

    pub fn end(&self) -> NodeRef {
        NodeRef::new(self.end_kind, self.end_id)
    }

    /// Identity of the edge itself, independent of its store id.
    pub fn key(&self) -> (NodeRef, NodeRef) {
        (self.start(), self.end())
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.start(), self.end())
    }
}

// ---------------------------------------------------------------------------
// PipelineGraph
// ---------------------------------------------------------------------------

/// Every node and flow belonging to one pipeline, as fetched from the graph store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub pipeline_id: PipelineId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputNode>,
    #[serde(default)]
    pub outputs: Vec<OutputNode>,
    #[serde(default)]
    pub transformations: Vec<TransformationNode>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl PipelineGraph {
    pub fn new(pipeline_id: PipelineId, name: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn input(&self, id: i64) -> Option<&InputNode> {
        self.inputs.iter().find(|n| n.id == id)
    }

    pub fn output(&self, id: i64) -> Option<&OutputNode> {
        self.outputs.iter().find(|n| n.id == id)
    }

    pub fn transformation(&self, id: i64) -> Option<&TransformationNode> {
        self.transformations.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, node: NodeRef) -> bool {
        match node {
            NodeRef::Input(id) => self.input(id).is_some(),
            NodeRef::Transformation(id) => self.transformation(id).is_some(),
            NodeRef::Output(id) => self.output(id).is_some(),
        }
    }

    /// All registered nodes: inputs, then transformations, then outputs, each in store order.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.inputs
            .iter()
            .map(|n| NodeRef::Input(n.id))
            .chain(self.transformations.iter().map(|n| NodeRef::Transformation(n.id)))
            .chain(self.outputs.iter().map(|n| NodeRef::Output(n.id)))
            .collect()
    }

    /// Human-readable label: the node's name when it has one, else its `kind_id` key.
    pub fn label(&self, node: NodeRef) -> String {
        let name = match node {
            NodeRef::Input(id) => self.input(id).and_then(|n| n.name.clone()),
            NodeRef::Transformation(id) => self.transformation(id).and_then(|n| n.name.clone()),
            NodeRef::Output(id) => self.output(id).and_then(|n| n.name.clone()),
        };
        match name {
            Some(name) => format!("{} '{}'", node.kind(), name),
            None => node.to_string(),
        }
    }

    /// Schema of the records a node emits (for transformations, `schema_out`).
    pub fn schema_out(&self, node: NodeRef) -> Option<&Schema> {
        match node {
            NodeRef::Input(id) => self.input(id)?.schema.as_ref(),
            NodeRef::Transformation(id) => self.transformation(id)?.schema_out.as_ref(),
            NodeRef::Output(id) => self.output(id)?.schema.as_ref(),
        }
    }

    /// Schema of the records a node expects (for transformations, `schema_in`).
    pub fn schema_in(&self, node: NodeRef) -> Option<&Schema> {
        match node {
            NodeRef::Input(id) => self.input(id)?.schema.as_ref(),
            NodeRef::Transformation(id) => self.transformation(id)?.schema_in.as_ref(),
            NodeRef::Output(id) => self.output(id)?.schema.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ref_display_uses_kind_and_id() {
        assert_eq!(NodeRef::Input(1).to_string(), "input_1");
        assert_eq!(NodeRef::Transformation(12).to_string(), "transformation_12");
        assert_eq!(NodeRef::Output(3).to_string(), "output_3");
    }

    #[test]
    fn node_ref_orders_by_kind_then_id() {
        let mut refs = vec![
            NodeRef::Output(1),
            NodeRef::Transformation(2),
            NodeRef::Input(9),
            NodeRef::Input(3),
        ];
        refs.sort();
        assert_eq!(
            refs,
            vec![
                NodeRef::Input(3),
                NodeRef::Input(9),
                NodeRef::Transformation(2),
                NodeRef::Output(1),
            ]
        );
    }

    #[test]
    fn same_id_different_kind_are_distinct_keys() {
        let mut set = std::collections::HashSet::new();
        set.insert(NodeRef::Input(1));
        set.insert(NodeRef::Output(1));
        set.insert(NodeRef::Transformation(1));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn flow_deserializes_from_store_record() {
        let flow: Flow = serde_json::from_str(
            r#"{"start_kind": "input", "start_id": 1, "end_kind": "transformation", "end_id": 2}"#,
        )
        .unwrap();
        assert_eq!(flow.start(), NodeRef::Input(1));
        assert_eq!(flow.end(), NodeRef::Transformation(2));
        assert_eq!(flow.to_string(), "input_1 -> transformation_2");
    }

    #[test]
    fn graph_lookups_and_schemas() {
        let mut schema_in = Schema::new();
        schema_in.insert("v".into(), "int".into());
        let graph = PipelineGraph {
            pipeline_id: 1,
            name: "demo".into(),
            inputs: vec![InputNode {
                id: 1,
                name: Some("sensors".into()),
                topic: "x".into(),
                broker_address: "b1:9092".into(),
                schema: None,
            }],
            outputs: vec![],
            transformations: vec![TransformationNode {
                id: 2,
                name: None,
                source_text: String::new(),
                schema_in: Some(schema_in.clone()),
                schema_out: None,
            }],
            flows: vec![],
        };

        assert!(graph.contains(NodeRef::Input(1)));
        assert!(!graph.contains(NodeRef::Output(1)));
        assert_eq!(graph.schema_in(NodeRef::Transformation(2)), Some(&schema_in));
        assert_eq!(graph.schema_out(NodeRef::Transformation(2)), None);
        assert_eq!(graph.label(NodeRef::Input(1)), "input 'sensors'");
        assert_eq!(graph.label(NodeRef::Transformation(2)), "transformation_2");
        assert_eq!(
            graph.nodes(),
            vec![NodeRef::Input(1), NodeRef::Transformation(2)]
        );
    }
}

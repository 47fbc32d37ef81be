//! Plan compiler: topological flow ordering and partitioning by broker.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use flowgate_types::{
    Flow, FlowgateError, InputNode, NodeRef, OutputNode, PipelineGraph, PipelineId, Result,
    TransformationNode,
};

/// Consumer group prefix used until the supervisor assigns run-specific groups.
pub const DEFAULT_GROUP_PREFIX: &str = "flowgate";

/// One broker partition of a plan, executed by a single worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub index: usize,
    pub broker: String,
    pub consumer_group: String,
    pub inputs: Vec<InputNode>,
    /// Flows reachable from `inputs`, in plan order.
    pub flows: Vec<Flow>,
    pub transformations: Vec<TransformationNode>,
    pub outputs: Vec<OutputNode>,
}

impl Cluster {
    pub fn transformation(&self, id: i64) -> Option<&TransformationNode> {
        self.transformations.iter().find(|t| t.id == id)
    }

    pub fn output(&self, id: i64) -> Option<&OutputNode> {
        self.outputs.iter().find(|o| o.id == id)
    }

    /// Whether any output of this cluster lives on another broker.
    pub fn bridges(&self) -> bool {
        self.outputs.iter().any(|o| o.broker_address != self.broker)
    }
}

/// Read-only execution artifact built from a validated graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub pipeline_id: PipelineId,
    pub ordered_flows: Vec<Flow>,
    pub clusters: Vec<Cluster>,
}

impl ExecutionPlan {
    /// Give every cluster its own consumer group for this run.
    pub fn assign_consumer_groups(&mut self, prefix: &str, run_tag: &str) {
        for cluster in &mut self.clusters {
            cluster.consumer_group = format!(
                "{prefix}-{}-{run_tag}-{}",
                self.pipeline_id, cluster.index
            );
        }
    }
}

/// Order flows with Kahn's algorithm over their endpoint nodes.
///
/// Nodes with equal in-degree are released in the order they first appear in
/// `flows`. Flows whose start node never reaches in-degree zero (cycles) are
/// appended in their original order.
pub fn sort_flows_topologically(flows: &[Flow]) -> Vec<Flow> {
    let mut appearance: Vec<NodeRef> = Vec::new();
    let mut seen: HashSet<NodeRef> = HashSet::new();
    let mut in_degree: HashMap<NodeRef, usize> = HashMap::new();
    let mut outgoing: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();

    for flow in flows {
        let (start, end) = flow.key();
        for node in [start, end] {
            if seen.insert(node) {
                appearance.push(node);
            }
        }
        *in_degree.entry(end).or_default() += 1;
        outgoing.entry(start).or_default().push(end);
    }

    let mut queue: VecDeque<NodeRef> = appearance
        .iter()
        .copied()
        .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
        .collect();
    let mut rank: HashMap<NodeRef, usize> = HashMap::new();

    while let Some(node) = queue.pop_front() {
        rank.insert(node, rank.len());
        for next in outgoing.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    let (mut ordered, leftover): (Vec<&Flow>, Vec<&Flow>) =
        flows.iter().partition(|f| rank.contains_key(&f.start()));
    // Stable: flows sharing a start node keep their store order.
    ordered.sort_by_key(|f| rank[&f.start()]);

    if !leftover.is_empty() {
        tracing::warn!(
            omitted = leftover.len(),
            "Topological order incomplete, appending remaining flows in store order"
        );
    }
    ordered.into_iter().chain(leftover).cloned().collect()
}

fn reachable_from(inputs: &[NodeRef], flows: &[Flow]) -> HashSet<NodeRef> {
    let mut adjacency: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();
    for flow in flows {
        adjacency.entry(flow.start()).or_default().push(flow.end());
    }
    let mut reached: HashSet<NodeRef> = inputs.iter().copied().collect();
    let mut queue: VecDeque<NodeRef> = inputs.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for next in adjacency.get(&node).into_iter().flatten() {
            if reached.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    reached
}

/// Compile a graph into an execution plan with one cluster per input broker.
pub fn compile(graph: &PipelineGraph) -> Result<ExecutionPlan> {
    if graph.inputs.is_empty() {
        return Err(FlowgateError::Compile(format!(
            "pipeline {} has no inputs",
            graph.pipeline_id
        )));
    }

    let ordered_flows = sort_flows_topologically(&graph.flows);

    let mut brokers: Vec<&str> = Vec::new();
    for input in &graph.inputs {
        if !brokers.contains(&input.broker_address.as_str()) {
            brokers.push(&input.broker_address);
        }
    }

    let clusters = brokers
        .into_iter()
        .enumerate()
        .map(|(index, broker)| {
            let inputs: Vec<InputNode> = graph
                .inputs
                .iter()
                .filter(|i| i.broker_address == broker)
                .cloned()
                .collect();
            let roots: Vec<NodeRef> = inputs.iter().map(|i| NodeRef::Input(i.id)).collect();
            let reached = reachable_from(&roots, &ordered_flows);

            let flows: Vec<Flow> = ordered_flows
                .iter()
                .filter(|f| reached.contains(&f.start()))
                .filter(|f| {
                    let known = graph.contains(f.end());
                    if !known {
                        tracing::warn!(flow = %f, "Skipping flow to unknown node");
                    }
                    known
                })
                .cloned()
                .collect();
            let transformations = graph
                .transformations
                .iter()
                .filter(|t| reached.contains(&NodeRef::Transformation(t.id)))
                .cloned()
                .collect();
            let outputs = graph
                .outputs
                .iter()
                .filter(|o| reached.contains(&NodeRef::Output(o.id)))
                .cloned()
                .collect();

            Cluster {
                index,
                broker: broker.to_string(),
                consumer_group: format!("{DEFAULT_GROUP_PREFIX}-{}-{index}", graph.pipeline_id),
                inputs,
                flows,
                transformations,
                outputs,
            }
        })
        .collect::<Vec<_>>();

    tracing::info!(
        pipeline_id = graph.pipeline_id,
        clusters = clusters.len(),
        flows = ordered_flows.len(),
        "Execution plan compiled"
    );

    Ok(ExecutionPlan {
        pipeline_id: graph.pipeline_id,
        ordered_flows,
        clusters,
    })
}

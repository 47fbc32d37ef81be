//! Pipeline validation: presence, connectivity, structural and advisory checks.
//!
//! [`Validator::validate`] runs the full check sequence and produces a
//! [`ValidationReport`]. The structural and advisory checks are plain
//! [`LintRule`]s over a [`PipelineGraph`] and can be run on their own with
//! [`lint`] (no network access involved).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use flowgate_broker::BrokerProbe;
use flowgate_types::{FlowgateError, NodeKind, NodeRef, PipelineGraph, Result, ValidationReport};

use crate::loader;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node: Option<NodeRef>,
    pub flow: Option<(NodeRef, NodeRef)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    fn error(rule: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            node: None,
            flow: None,
        }
    }

    fn warning(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn at_node(mut self, node: NodeRef) -> Self {
        self.node = Some(node);
        self
    }

    fn at_flow(mut self, flow: (NodeRef, NodeRef)) -> Self {
        self.flow = Some(flow);
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn severity(&self) -> Severity;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

fn adjacency(graph: &PipelineGraph) -> BTreeMap<NodeRef, Vec<NodeRef>> {
    let mut adj: BTreeMap<NodeRef, Vec<NodeRef>> = BTreeMap::new();
    for flow in &graph.flows {
        adj.entry(flow.start()).or_default().push(flow.end());
    }
    adj
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct FlowDirectionRule;
impl LintRule for FlowDirectionRule {
    fn name(&self) -> &str { "flow_direction" }
    fn severity(&self) -> Severity { Severity::Error }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for flow in &graph.flows {
            let flow_id = flow
                .id
                .map(|id| format!(" (flow {id})"))
                .unwrap_or_default();
            if flow.end_kind == NodeKind::Input {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Flow {flow}: an input cannot be a destination{flow_id}"),
                    )
                    .at_flow(flow.key()),
                );
            }
            if flow.start_kind == NodeKind::Output {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Flow {flow}: an output cannot be a source{flow_id}"),
                    )
                    .at_flow(flow.key()),
                );
            }
        }
        diags
    }
}

struct FlowEndpointsExistRule;
impl LintRule for FlowEndpointsExistRule {
    fn name(&self) -> &str { "flow_endpoints_exist" }
    fn severity(&self) -> Severity { Severity::Error }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for flow in &graph.flows {
            for node in [flow.start(), flow.end()] {
                if !graph.contains(node) {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Flow {flow} references unknown node {node}"),
                        )
                        .at_node(node)
                        .at_flow(flow.key()),
                    );
                }
            }
        }
        diags
    }
}

/// Depth-first cycle search. Reports only the first cycle found.
struct CycleRule;

impl CycleRule {
    fn find_cycle(adj: &BTreeMap<NodeRef, Vec<NodeRef>>, roots: &[NodeRef]) -> Option<Vec<NodeRef>> {
        let mut visited: HashSet<NodeRef> = HashSet::new();

        for &root in roots {
            if visited.contains(&root) {
                continue;
            }
            // Explicit stack of (node, next-neighbour index); `path` mirrors the
            // recursion stack.
            let mut stack: Vec<(NodeRef, usize)> = vec![(root, 0)];
            let mut path: Vec<NodeRef> = vec![root];
            let mut on_path: HashSet<NodeRef> = HashSet::from([root]);
            visited.insert(root);

            while let Some((node, idx)) = stack.last_mut() {
                let neighbours = adj.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(&next) = neighbours.get(*idx) {
                    *idx += 1;
                    if on_path.contains(&next) {
                        let from = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    if visited.insert(next) {
                        stack.push((next, 0));
                        path.push(next);
                        on_path.insert(next);
                    }
                } else {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
        None
    }
}

impl LintRule for CycleRule {
    fn name(&self) -> &str { "cycle" }
    fn severity(&self) -> Severity { Severity::Error }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let adj = adjacency(graph);
        let mut roots = graph.nodes();
        for flow in &graph.flows {
            if !roots.contains(&flow.start()) {
                roots.push(flow.start());
            }
        }
        match Self::find_cycle(&adj, &roots) {
            Some(cycle) => {
                let path = cycle
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                vec![Diagnostic::error(
                    self.name(),
                    format!("Cycle detected in pipeline flows: {path}"),
                )
                .at_node(cycle[0])]
            }
            None => vec![],
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn severity(&self) -> Severity { Severity::Error }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let adj = adjacency(graph);
        let mut visited: HashSet<NodeRef> = HashSet::new();
        let mut queue: VecDeque<NodeRef> = graph.inputs.iter().map(|n| NodeRef::Input(n.id)).collect();
        visited.extend(queue.iter().copied());

        while let Some(current) = queue.pop_front() {
            for next in adj.get(&current).into_iter().flatten() {
                if visited.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }

        graph
            .nodes()
            .into_iter()
            .filter(|node| node.kind() != NodeKind::Input && !visited.contains(node))
            .map(|node| {
                Diagnostic::error(
                    self.name(),
                    format!("{} is not reachable from any input", graph.label(node)),
                )
                .at_node(node)
            })
            .collect()
    }
}

struct SchemaCompatibilityRule;
impl LintRule for SchemaCompatibilityRule {
    fn name(&self) -> &str { "schema_compatibility" }
    fn severity(&self) -> Severity { Severity::Warning }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .flows
            .iter()
            .filter_map(|flow| {
                let produced = graph.schema_out(flow.start())?;
                let expected = graph.schema_in(flow.end())?;
                if produced.is_empty() || expected.is_empty() {
                    return None;
                }
                let missing: BTreeSet<&String> = expected
                    .keys()
                    .filter(|k| !produced.contains_key(*k))
                    .collect();
                if missing.is_empty() {
                    return None;
                }
                let keys = missing.into_iter().cloned().collect::<Vec<_>>().join(", ");
                Some(
                    Diagnostic::warning(
                        self.name(),
                        format!("Schema mismatch between {} and {}: missing keys {keys}", flow.start(), flow.end()),
                    )
                    .at_flow(flow.key()),
                )
            })
            .collect()
    }
}

struct TransformationCompilesRule;
impl LintRule for TransformationCompilesRule {
    fn name(&self) -> &str { "transformation_compiles" }
    fn severity(&self) -> Severity { Severity::Warning }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .transformations
            .iter()
            .filter_map(|t| {
                let node = NodeRef::Transformation(t.id);
                loader::check_source(&t.source_text).err().map(|e| {
                    Diagnostic::warning(
                        self.name(),
                        format!("{} will pass records through unchanged: {e}", graph.label(node)),
                    )
                    .at_node(node)
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(FlowDirectionRule),
        Box::new(FlowEndpointsExistRule),
        Box::new(CycleRule),
        Box::new(ReachabilityRule),
        Box::new(SchemaCompatibilityRule),
        Box::new(TransformationCompilesRule),
    ]
}

/// Errors for every missing node/flow category; empty when all are present.
pub fn check_presence(graph: &PipelineGraph) -> Vec<String> {
    let mut errors = Vec::new();
    if graph.inputs.is_empty() {
        errors.push("Pipeline has no inputs defined.".to_string());
    }
    if graph.outputs.is_empty() {
        errors.push("Pipeline has no outputs defined.".to_string());
    }
    if graph.flows.is_empty() {
        errors.push("Pipeline has no flows (connections) defined.".to_string());
    }
    errors
}

/// Run the error-severity rules, then the warning rules if no error was found.
pub fn lint(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let (structural, advisory): (Vec<_>, Vec<_>) = rules()
        .into_iter()
        .partition(|rule| rule.severity() == Severity::Error);

    let mut diagnostics: Vec<Diagnostic> = structural.iter().flat_map(|rule| rule.apply(graph)).collect();
    if diagnostics.iter().all(|d| d.severity != Severity::Error) {
        for rule in &advisory {
            diagnostics.extend(rule.apply(graph));
        }
    }
    diagnostics
}

/// Full pre-start validation with an injected broker reachability probe.
#[derive(Clone)]
pub struct Validator {
    probe: Arc<dyn BrokerProbe>,
}

impl Validator {
    pub fn new(probe: Arc<dyn BrokerProbe>) -> Self {
        Self { probe }
    }

    /// One error per distinct unreachable broker, naming the nodes that use it.
    pub async fn check_connectivity(&self, graph: &PipelineGraph) -> Vec<String> {
        let mut users: Vec<(String, Vec<NodeRef>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let endpoints = graph
            .inputs
            .iter()
            .map(|n| (n.broker_address.clone(), NodeRef::Input(n.id)))
            .chain(
                graph
                    .outputs
                    .iter()
                    .map(|n| (n.broker_address.clone(), NodeRef::Output(n.id))),
            );
        for (address, node) in endpoints {
            let slot = *index.entry(address.clone()).or_insert_with(|| {
                users.push((address, Vec::new()));
                users.len() - 1
            });
            users[slot].1.push(node);
        }

        let probes = users.iter().map(|(address, _)| self.probe.is_reachable(address));
        let reachable = futures::future::join_all(probes).await;

        users
            .iter()
            .zip(reachable)
            .filter(|(_, ok)| !ok)
            .map(|((address, nodes), _)| {
                tracing::warn!(broker = %address, "Broker unreachable");
                let used_by = nodes
                    .iter()
                    .map(|n| graph.label(*n))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Cannot reach broker at {address} (used by {used_by})")
            })
            .collect()
    }

    pub async fn validate(&self, graph: &PipelineGraph) -> ValidationReport {
        let presence = check_presence(graph);
        if !presence.is_empty() {
            return ValidationReport::new(presence, vec![]);
        }

        let mut errors = self.check_connectivity(graph).await;
        let mut warnings = Vec::new();
        for diag in lint(graph) {
            match diag.severity {
                Severity::Error => errors.push(diag.message),
                Severity::Warning => warnings.push(diag.message),
            }
        }

        tracing::debug!(
            pipeline_id = graph.pipeline_id,
            errors = errors.len(),
            warnings = warnings.len(),
            "Validation finished"
        );
        ValidationReport::new(errors, warnings)
    }

    /// Validate and return `Err` if any error was reported.
    pub async fn validate_or_raise(&self, graph: &PipelineGraph) -> Result<ValidationReport> {
        let report = self.validate(graph).await;
        if report.valid {
            Ok(report)
        } else {
            Err(FlowgateError::Validation(report.summary()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

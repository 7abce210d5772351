//! Graph validation and execution planning.
//!
//! A [`FlowPlan`] is the validated, indexed form of a submitted graph:
//! per-node incoming/outgoing edge lists in declaration order, input
//! policies resolved from the registry, and loop scopes paired with their
//! boundary nodes. All structural failures surface here as
//! [`ValidationError`] before any node executes.

use crate::registry::NodeRegistry;
use loomcore::{
    Flow, InputPolicy, ValidationError, SPEC_LOOP, SPEC_LOOP_END, SPEC_OUTPUT,
};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// One loop node's bounded scope: the body between it and its paired
/// `loop-end`, pre-planned as a sub-flow the scheduler re-executes once
/// per array element.
pub struct LoopScope {
    pub loop_node: usize,
    pub end_node: usize,
    pub body: Vec<usize>,
    pub sub_plan: Arc<FlowPlan>,
}

/// Validated execution plan for one graph.
pub struct FlowPlan {
    pub flow: Flow,
    /// Node id -> index into `flow.nodes`.
    pub index_of: HashMap<String, usize>,
    /// Per node, incoming edge indices in edge declaration order.
    pub incoming: Vec<Vec<usize>>,
    /// Per node, outgoing edge indices.
    pub outgoing: Vec<Vec<usize>>,
    /// Per edge, target node index.
    pub edge_target: Vec<usize>,
    /// Per node, readiness rule from the registry.
    pub policies: Vec<InputPolicy>,
    /// Scopes for loop nodes the scheduler dispatches directly.
    pub scopes: HashMap<usize, LoopScope>,
    /// Nodes owned by some loop scope; never dispatched at this level.
    pub scoped: HashSet<usize>,
    /// Output nodes in declaration order (finalOutputs ordering).
    pub output_nodes: Vec<usize>,
    /// Edge sources outside this plan, resolved from seed values.
    pub external_sources: HashSet<String>,
}

impl FlowPlan {
    pub fn build(flow: Flow, registry: &NodeRegistry) -> Result<Self, ValidationError> {
        Self::build_scoped(flow, registry, HashSet::new())
    }

    fn build_scoped(
        flow: Flow,
        registry: &NodeRegistry,
        external_sources: HashSet<String>,
    ) -> Result<Self, ValidationError> {
        let node_count = flow.nodes.len();

        let mut index_of = HashMap::with_capacity(node_count);
        for (i, node) in flow.nodes.iter().enumerate() {
            if index_of.insert(node.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateNodeId(node.id.clone()));
            }
            if !registry.contains(&node.spec_id) {
                return Err(ValidationError::UnknownSpecId(node.spec_id.clone()));
            }
        }

        let mut incoming = vec![Vec::new(); node_count];
        let mut outgoing = vec![Vec::new(); node_count];
        let mut edge_target = Vec::with_capacity(flow.edges.len());
        for (ei, edge) in flow.edges.iter().enumerate() {
            let target = *index_of
                .get(&edge.target)
                .ok_or_else(|| ValidationError::UnknownEdgeNode(edge.target.clone()))?;
            match index_of.get(&edge.source) {
                Some(&source) => {
                    outgoing[source].push(ei);
                    incoming[target].push(ei);
                }
                None if external_sources.contains(&edge.source) => {
                    incoming[target].push(ei);
                }
                None => return Err(ValidationError::UnknownEdgeNode(edge.source.clone())),
            }
            edge_target.push(target);
        }

        // Cycle detection over the in-plan edges. The loop construct is not
        // a graph cycle: its repetition lives in the scheduler.
        let mut graph = DiGraph::<usize, ()>::new();
        let petgraph_idx: Vec<_> = (0..node_count).map(|i| graph.add_node(i)).collect();
        for edge in &flow.edges {
            if let (Some(&s), Some(&t)) = (index_of.get(&edge.source), index_of.get(&edge.target))
            {
                graph.add_edge(petgraph_idx[s], petgraph_idx[t], ());
            }
        }
        let topo = toposort(&graph, None).map_err(|_| ValidationError::CyclicDependency)?;
        let mut topo_pos = vec![0usize; node_count];
        for (pos, petgraph_node) in topo.iter().enumerate() {
            topo_pos[graph[*petgraph_node]] = pos;
        }

        let mut output_nodes = Vec::new();
        for (i, node) in flow.nodes.iter().enumerate() {
            if node.spec_id == SPEC_OUTPUT {
                if !outgoing[i].is_empty() {
                    return Err(ValidationError::OutputNotTerminal(node.id.clone()));
                }
                output_nodes.push(i);
            }
        }

        let policies = flow
            .nodes
            .iter()
            .map(|n| registry.input_policy(&n.spec_id).unwrap_or_default())
            .collect();

        let pairings = pair_loops(&flow, &outgoing, &edge_target, &topo_pos)?;

        let mut scoped = HashSet::new();
        let mut bodies = HashMap::new();
        for &(loop_node, end_node) in &pairings {
            let body = collect_body(loop_node, end_node, &outgoing, &edge_target);
            if body.is_empty() {
                return Err(ValidationError::EmptyLoopBody(flow.nodes[loop_node].id.clone()));
            }
            check_body_containment(loop_node, end_node, &body, &flow, &index_of)?;
            scoped.insert(end_node);
            scoped.extend(body.iter().copied());
            bodies.insert(loop_node, (end_node, body));
        }

        // Sub-plans only for loops dispatched at this level; nested loops
        // are re-planned inside their parent's sub-flow.
        let mut scopes = HashMap::new();
        for (loop_node, (end_node, body)) in bodies {
            if scoped.contains(&loop_node) {
                continue;
            }
            let sub_flow = carve_sub_flow(loop_node, end_node, &body, &flow, &index_of);
            let loop_id = flow.nodes[loop_node].id.clone();
            let sub_plan = Arc::new(Self::build_scoped(
                sub_flow,
                registry,
                HashSet::from([loop_id]),
            )?);
            scopes.insert(
                loop_node,
                LoopScope {
                    loop_node,
                    end_node,
                    body,
                    sub_plan,
                },
            );
        }

        Ok(Self {
            flow,
            index_of,
            incoming,
            outgoing,
            edge_target,
            policies,
            scopes,
            scoped,
            output_nodes,
            external_sources,
        })
    }

    /// Nodes this plan dispatches itself (everything not owned by a scope).
    pub fn is_schedulable(&self, idx: usize) -> bool {
        !self.scoped.contains(&idx)
    }
}

/// Pair every loop node with its boundary. Loops are processed deepest
/// (topologically last) first; a BFS from each loop jumps over already
/// paired inner scopes, so the first unpaired `loop-end` it reaches is its
/// own boundary.
fn pair_loops(
    flow: &Flow,
    outgoing: &[Vec<usize>],
    edge_target: &[usize],
    topo_pos: &[usize],
) -> Result<Vec<(usize, usize)>, ValidationError> {
    let mut loops: Vec<usize> = flow
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.spec_id == SPEC_LOOP)
        .map(|(i, _)| i)
        .collect();
    loops.sort_by_key(|&i| std::cmp::Reverse(topo_pos[i]));

    let mut paired: Vec<(usize, usize)> = Vec::new();
    let mut end_of: HashMap<usize, usize> = HashMap::new();
    let mut claimed_ends: HashSet<usize> = HashSet::new();

    for &loop_node in &loops {
        let mut visited = HashSet::from([loop_node]);
        let mut queue: VecDeque<usize> = VecDeque::from([loop_node]);
        let mut found = None;

        while let Some(current) = queue.pop_front() {
            let spec = &flow.nodes[current].spec_id;
            if current != loop_node {
                if spec == SPEC_LOOP_END && !claimed_ends.contains(&current) {
                    found = Some(current);
                    break;
                }
                if spec == SPEC_LOOP {
                    // An inner loop: continue from its (already paired) end
                    // instead of descending into its body.
                    let inner_end = *end_of.get(&current).ok_or_else(|| {
                        ValidationError::UnpairedLoop(flow.nodes[current].id.clone())
                    })?;
                    if visited.insert(inner_end) {
                        queue.push_back(inner_end);
                    }
                    continue;
                }
            }
            for &ei in &outgoing[current] {
                let next = edge_target[ei];
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let end_node =
            found.ok_or_else(|| ValidationError::UnpairedLoop(flow.nodes[loop_node].id.clone()))?;
        end_of.insert(loop_node, end_node);
        claimed_ends.insert(end_node);
        paired.push((loop_node, end_node));
    }

    // Every loop-end must belong to a loop.
    for (i, node) in flow.nodes.iter().enumerate() {
        if node.spec_id == SPEC_LOOP_END && !claimed_ends.contains(&i) {
            return Err(ValidationError::Invalid(format!(
                "loop-end node '{}' has no matching loop",
                node.id
            )));
        }
    }

    Ok(paired)
}

/// Everything reachable from the loop node without crossing its boundary,
/// excluding both endpoints.
fn collect_body(
    loop_node: usize,
    end_node: usize,
    outgoing: &[Vec<usize>],
    edge_target: &[usize],
) -> Vec<usize> {
    let mut visited = HashSet::from([loop_node, end_node]);
    let mut queue = VecDeque::from([loop_node]);
    let mut body = Vec::new();

    while let Some(current) = queue.pop_front() {
        if current == end_node {
            continue;
        }
        for &ei in &outgoing[current] {
            let next = edge_target[ei];
            if visited.insert(next) {
                body.push(next);
                queue.push_back(next);
            }
        }
    }

    body
}

/// Body nodes may only exchange data inside their scope: inputs from the
/// loop node or other body nodes, outputs to body nodes or the boundary.
fn check_body_containment(
    loop_node: usize,
    end_node: usize,
    body: &[usize],
    flow: &Flow,
    index_of: &HashMap<String, usize>,
) -> Result<(), ValidationError> {
    let loop_id = &flow.nodes[loop_node].id;
    let in_scope: HashSet<usize> = body.iter().copied().collect();

    for edge in &flow.edges {
        let (Some(&source), Some(&target)) =
            (index_of.get(&edge.source), index_of.get(&edge.target))
        else {
            continue;
        };
        let source_inside = source == loop_node || in_scope.contains(&source);
        let target_inside = in_scope.contains(&target) || target == end_node;
        if in_scope.contains(&target) && !source_inside {
            return Err(ValidationError::LoopBodyEscape {
                loop_id: loop_id.clone(),
                node: flow.nodes[target].id.clone(),
            });
        }
        if in_scope.contains(&source) && !target_inside {
            return Err(ValidationError::LoopBodyEscape {
                loop_id: loop_id.clone(),
                node: flow.nodes[source].id.clone(),
            });
        }
    }
    Ok(())
}

/// Extract the body (plus boundary) as a standalone flow; edges from the
/// loop node survive with an external source resolved from iteration seeds.
fn carve_sub_flow(
    loop_node: usize,
    end_node: usize,
    body: &[usize],
    flow: &Flow,
    index_of: &HashMap<String, usize>,
) -> Flow {
    let in_scope: HashSet<usize> = body.iter().copied().chain([end_node]).collect();
    let loop_id = &flow.nodes[loop_node].id;

    let mut sub = Flow::new(format!("{}::{}", flow.id, loop_id));
    for &i in body {
        sub.nodes.push(flow.nodes[i].clone());
    }
    sub.nodes.push(flow.nodes[end_node].clone());

    for edge in &flow.edges {
        let (Some(&source), Some(&target)) =
            (index_of.get(&edge.source), index_of.get(&edge.target))
        else {
            continue;
        };
        if !in_scope.contains(&target) {
            continue;
        }
        if source == loop_node || in_scope.contains(&source) {
            sub.edges.push(edge.clone());
        }
    }
    sub
}

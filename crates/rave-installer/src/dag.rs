//! Dependency ordering over step `needs`
//!
//! Cycle detection runs on a petgraph `DiGraphMap`; the execution order itself
//! is a depth-first post-order walk over steps in declared order, visiting each
//! step's needs in the order they are listed. That keeps the order stable for
//! a fixed plan and lets independent steps run in the order they were written.

use crate::error::PlanError;
use crate::plan::{Plan, StepSpec};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Needs that name a step missing from the plan, as `(step, missing)` pairs
#[must_use]
pub fn unknown_needs(plan: &Plan) -> Vec<(String, String)> {
    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    plan.steps
        .iter()
        .flat_map(|step| {
            step.needs
                .iter()
                .filter(|need| !ids.contains(need.as_str()))
                .map(|need| (step.id.clone(), need.clone()))
        })
        .collect()
}

/// Fail if any step transitively needs itself
///
/// # Errors
/// - `PlanError::CycleDetected` naming a step on the cycle
pub fn check_acyclic(plan: &Plan) -> Result<(), PlanError> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for step in &plan.steps {
        graph.add_node(step.id.as_str());
    }
    for step in &plan.steps {
        for need in &step.needs {
            if graph.contains_node(need.as_str()) {
                graph.add_edge(need.as_str(), step.id.as_str(), ());
            }
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| PlanError::CycleDetected {
            step: cycle.node_id().to_string(),
        })
}

/// Steps in execution order
///
/// Unknown needs are logged and treated as satisfied.
///
/// # Errors
/// - `PlanError::CycleDetected` naming a step on the cycle
pub fn execution_order(plan: &Plan) -> Result<Vec<StepSpec>, PlanError> {
    for (step, missing) in unknown_needs(plan) {
        warn!(step = %step, need = %missing, "step needs unknown step; treating as satisfied");
    }
    check_acyclic(plan)?;

    let index: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut visited = vec![false; plan.steps.len()];
    let mut order = Vec::with_capacity(plan.steps.len());

    for root in 0..plan.steps.len() {
        visit(plan, &index, root, &mut visited, &mut order);
    }

    Ok(order.into_iter().map(|i| plan.steps[i].clone()).collect())
}

/// Iterative post-order DFS; acyclicity is already established
fn visit(
    plan: &Plan,
    index: &HashMap<&str, usize>,
    root: usize,
    visited: &mut [bool],
    order: &mut Vec<usize>,
) {
    if visited[root] {
        return;
    }
    visited[root] = true;
    // (step, next need to look at)
    let mut stack = vec![(root, 0usize)];

    while let Some((current, cursor)) = stack.pop() {
        let needs = &plan.steps[current].needs;
        let next = needs[cursor..]
            .iter()
            .enumerate()
            .find_map(|(offset, need)| {
                index
                    .get(need.as_str())
                    .copied()
                    .filter(|&i| !visited[i])
                    .map(|i| (cursor + offset, i))
            });

        match next {
            Some((position, dep)) => {
                stack.push((current, position + 1));
                visited[dep] = true;
                stack.push((dep, 0));
            }
            None => order.push(current),
        }
    }
}

//! Batch resolution and dependency validation for workflow steps.
//!
//! Steps run in `order`. Consecutive steps that share a parallel group form
//! one concurrent batch; everything else runs alone. `depends_on` edges are
//! never used to reorder steps, only validated: they must be acyclic
//! (`petgraph` toposort) and must point at a step that finishes in an earlier
//! batch.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tradeflow_types::workflow::WorkflowStep;
use uuid::Uuid;

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// A unit of scheduling: one step, or a group of steps run concurrently.
#[derive(Debug, Clone)]
pub enum Batch<'a> {
    Single(&'a WorkflowStep),
    Parallel {
        group: String,
        steps: Vec<&'a WorkflowStep>,
    },
}

impl<'a> Batch<'a> {
    pub fn steps(&self) -> Vec<&'a WorkflowStep> {
        match self {
            Batch::Single(step) => vec![*step],
            Batch::Parallel { steps, .. } => steps.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Single(_) => 1,
            Batch::Parallel { steps, .. } => steps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Batch::Parallel { .. })
    }
}

/// Group ordered steps into sequential and parallel batches.
///
/// Scans steps by ascending `order`, accumulating consecutive steps with
/// `can_run_parallel` and the same non-empty `parallel_group`. Any other step
/// flushes the pending group and becomes a batch of its own. A group that
/// collects a single step is emitted as `Single`.
pub fn resolve_batches(steps: &[WorkflowStep]) -> Vec<Batch<'_>> {
    let mut ordered: Vec<&WorkflowStep> = steps.iter().collect();
    ordered.sort_by_key(|s| s.order);

    let mut batches = Vec::new();
    let mut pending: Vec<&WorkflowStep> = Vec::new();
    let mut pending_group: Option<&str> = None;

    for step in ordered {
        match step.parallel_key() {
            Some(group) if pending_group == Some(group) => pending.push(step),
            Some(group) => {
                flush(&mut batches, &mut pending, pending_group);
                pending_group = Some(group);
                pending.push(step);
            }
            None => {
                flush(&mut batches, &mut pending, pending_group);
                pending_group = None;
                batches.push(Batch::Single(step));
            }
        }
    }
    flush(&mut batches, &mut pending, pending_group);

    batches
}

fn flush<'a>(batches: &mut Vec<Batch<'a>>, pending: &mut Vec<&'a WorkflowStep>, group: Option<&str>) {
    match pending.len() {
        0 => {}
        1 => batches.push(Batch::Single(pending[0])),
        _ => batches.push(Batch::Parallel {
            group: group.unwrap_or_default().to_string(),
            steps: pending.clone(),
        }),
    }
    pending.clear();
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow's steps before they are persisted.
///
/// Rejects duplicate names or orders, dependencies on unknown steps,
/// dependency cycles, and dependencies that batching can never satisfy (on a
/// step that runs later, or on a sibling in the same parallel batch).
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), DefinitionError> {
    let mut names = HashSet::new();
    let mut orders = HashSet::new();
    for step in steps {
        if !names.insert(step.name.as_str()) {
            return Err(DefinitionError::DuplicateStep(step.name.clone()));
        }
        if !orders.insert(step.order) {
            return Err(DefinitionError::Invalid(format!(
                "step '{}' reuses order {}",
                step.name, step.order
            )));
        }
    }

    let by_id: HashMap<Uuid, &WorkflowStep> = steps.iter().map(|s| (s.id, s)).collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<Uuid, _> = steps
        .iter()
        .map(|s| (s.id, graph.add_node(s.name.as_str())))
        .collect();

    for step in steps {
        for dep in &step.depends_on {
            let Some(from) = nodes.get(dep) else {
                return Err(DefinitionError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.to_string(),
                });
            };
            graph.add_edge(*from, nodes[&step.id], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        DefinitionError::CycleDetected(graph[cycle.node_id()].to_string())
    })?;

    let batch_of: HashMap<Uuid, usize> = resolve_batches(steps)
        .iter()
        .enumerate()
        .flat_map(|(i, batch)| batch.steps().into_iter().map(move |s| (s.id, i)))
        .collect();

    for step in steps {
        for dep in &step.depends_on {
            let dependency = by_id[dep];
            let reason = if dependency.order >= step.order {
                Some("dependency runs later")
            } else if batch_of[dep] == batch_of[&step.id] {
                Some("dependency is in the same parallel batch")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DefinitionError::UnsatisfiableDependency {
                    step: step.name.clone(),
                    dependency: dependency.name.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tradeflow_types::workflow::StepKind;

    fn step(workflow_id: Uuid, name: &str, order: i32, group: Option<&str>) -> WorkflowStep {
        let mut s = WorkflowStep::new(workflow_id, name, StepKind::DataTransform, order);
        if let Some(g) = group {
            s.can_run_parallel = true;
            s.parallel_group = Some(g.to_string());
        }
        s
    }

    fn names(batches: &[Batch<'_>]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.steps().iter().map(|s| s.name.clone()).collect())
            .collect()
    }

    #[test]
    fn test_parallel_group_in_the_middle() {
        let wf = Uuid::now_v7();
        let steps = vec![
            step(wf, "1", 1, None),
            step(wf, "2", 2, Some("g")),
            step(wf, "3", 3, Some("g")),
            step(wf, "4", 4, None),
        ];
        let batches = resolve_batches(&steps);
        assert_eq!(names(&batches), vec![vec!["1"], vec!["2", "3"], vec!["4"]]);
        assert!(!batches[0].is_parallel());
        assert!(batches[1].is_parallel());
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let wf = Uuid::now_v7();
        let steps = vec![step(wf, "b", 2, None), step(wf, "a", 1, None)];
        assert_eq!(names(&resolve_batches(&steps)), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_group_split_by_interloper_is_two_batches() {
        let wf = Uuid::now_v7();
        let steps = vec![
            step(wf, "a", 1, Some("g")),
            step(wf, "b", 2, Some("g")),
            step(wf, "c", 3, None),
            step(wf, "d", 4, Some("g")),
            step(wf, "e", 5, Some("g")),
        ];
        assert_eq!(
            names(&resolve_batches(&steps)),
            vec![vec!["a", "b"], vec!["c"], vec!["d", "e"]]
        );
    }

    #[test]
    fn test_adjacent_groups_do_not_merge() {
        let wf = Uuid::now_v7();
        let steps = vec![
            step(wf, "a", 1, Some("x")),
            step(wf, "b", 2, Some("x")),
            step(wf, "c", 3, Some("y")),
            step(wf, "d", 4, Some("y")),
        ];
        assert_eq!(
            names(&resolve_batches(&steps)),
            vec![vec!["a", "b"], vec!["c", "d"]]
        );
    }

    #[test]
    fn test_group_without_flag_is_sequential() {
        let wf = Uuid::now_v7();
        let mut a = step(wf, "a", 1, Some("g"));
        a.can_run_parallel = false;
        let b = step(wf, "b", 2, Some("g"));
        let pair = [a, b];
        let batches = resolve_batches(&pair);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| !b.is_parallel()));
    }

    #[test]
    fn test_empty_steps() {
        assert!(resolve_batches(&[]).is_empty());
    }

    #[test]
    fn test_validate_accepts_backward_dependencies() {
        let wf = Uuid::now_v7();
        let fetch = step(wf, "fetch", 1, None);
        let mut validate = step(wf, "validate", 2, None);
        validate.depends_on = vec![fetch.id];
        assert!(validate_steps(&[fetch, validate]).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_name() {
        let wf = Uuid::now_v7();
        let err = validate_steps(&[step(wf, "a", 1, None), step(wf, "a", 2, None)]).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStep(ref n) if n == "a"));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let wf = Uuid::now_v7();
        let mut a = step(wf, "a", 1, None);
        a.depends_on = vec![Uuid::now_v7()];
        assert!(matches!(
            validate_steps(&[a]).unwrap_err(),
            DefinitionError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let wf = Uuid::now_v7();
        let mut a = step(wf, "a", 1, None);
        let mut b = step(wf, "b", 2, None);
        a.depends_on = vec![b.id];
        b.depends_on = vec![a.id];
        let err = validate_steps(&[a, b]).unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected(_)), "got {err}");
    }

    #[test]
    fn test_validate_rejects_forward_dependency() {
        let wf = Uuid::now_v7();
        let mut a = step(wf, "a", 1, None);
        let b = step(wf, "b", 2, None);
        a.depends_on = vec![b.id];
        assert!(matches!(
            validate_steps(&[a, b]).unwrap_err(),
            DefinitionError::UnsatisfiableDependency { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_sibling_dependency() {
        let wf = Uuid::now_v7();
        let a = step(wf, "a", 1, Some("g"));
        let mut b = step(wf, "b", 2, Some("g"));
        b.depends_on = vec![a.id];
        let err = validate_steps(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("same parallel batch"), "got {err}");
    }
}

use std::collections::HashSet;

use crate::core::ArcStr;
use crate::graph::Graph;

/// Expand the needed flags to their transitive closure, then collect the
/// needed tasks that can actually contribute to the merged output.
///
/// A task makes the cut only when it (a) was dispatched this run and (b)
/// carries a non-empty artifact, since a task can be logically required
/// without contributing anything mergeable, e.g. when it only returns a
/// scalar.
/// The returned list preserves dispatch (chain) order.
pub(crate) fn expand(graph: &mut Graph, chain: &[ArcStr]) -> Vec<ArcStr> {
    loop {
        let wanted: HashSet<ArcStr> = graph
            .tasks
            .values()
            .filter(|task| task.needed)
            .flat_map(|task| task.requires.iter().cloned())
            .collect();

        let mut changed = false;
        for task in graph.tasks.values_mut() {
            if !task.needed && wanted.contains(&task.id) {
                task.needed = true;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    chain
        .iter()
        .filter(|id| {
            graph
                .tasks
                .get(*id)
                .is_some_and(|task| task.needed && !task.artifact.is_empty())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::core::Value;
    use crate::graph::Graph;
    use crate::pipeline::Unit;
    use crate::task::producer;

    use super::*;

    fn sample_graph() -> Graph {
        let mut graph = Graph::new();

        graph.add_value("base", Value::Int(1)).unwrap();
        graph
            .task("mid")
            .input("base", "base")
            .produced_by(producer(["base"], |scope, _| {
                scope.add_unit(Unit::new("mid"));
                Ok(Value::Int(2))
            }))
            .unwrap();
        graph
            .task("top")
            .input("mid", "mid")
            .produced_by(producer(["mid"], |scope, _| {
                scope.add_unit(Unit::new("top"));
                Ok(Value::Int(3))
            }))
            .unwrap();
        graph
            .task("unrelated")
            .produced_by(producer(std::iter::empty::<&str>(), |scope, _| {
                scope.add_unit(Unit::new("unrelated"));
                Ok(Value::Int(4))
            }))
            .unwrap();

        graph
    }

    #[test]
    fn test_closure_is_superset_of_seed_and_subset_of_chain() {
        let mut graph = sample_graph();
        graph.mark_needed("top");

        let chain: Vec<ArcStr> = ["base", "mid", "top", "unrelated"]
            .into_iter()
            .map(ArcStr::from)
            .collect();

        // Give every chained task an executed look by invoking through the
        // public resolve path.
        let mut pipeline = crate::pipeline::Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();

        let needed = expand(&mut graph, &chain);

        // Superset of the seed.
        assert!(needed.iter().any(|id| id.as_ref() == "top"));
        // Subset of the chain.
        assert!(needed.iter().all(|id| chain.contains(id)));
        // Transitive requirement picked up, artifact-less base excluded.
        assert!(graph.task_needed("mid").unwrap());
        assert!(graph.task_needed("base").unwrap());
        assert!(needed.iter().all(|id| id.as_ref() != "unrelated"));
    }

    #[test]
    fn test_tasks_outside_chain_are_filtered() {
        let mut graph = sample_graph();
        graph.mark_needed("top");

        let mut pipeline = crate::pipeline::Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();

        // Pretend only "top" was dispatched.
        let chain: Vec<ArcStr> = vec![ArcStr::from("top")];
        let needed = expand(&mut graph, &chain);

        let ids: Vec<&str> = needed.iter().map(|id| id.as_ref()).collect();
        assert_eq!(ids, ["top"]);
    }
}

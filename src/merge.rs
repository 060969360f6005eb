use crate::core::ArcStr;
use crate::graph::Graph;
use crate::pipeline::{Pipeline, Step};

/// Splice the artifacts of the needed tasks into the shared output, in the
/// final reordered order.
///
/// Tasks restored from a checkpoint contributed their artifact in the run
/// that originally computed them, so only freshly computed tasks merge. A
/// task with a condition has its whole fragment wrapped in a single branch;
/// everything else merges flat, preserving the fragment's internal order.
pub(crate) fn into_pipeline(graph: &Graph, order: &[ArcStr], pipeline: &mut Pipeline) {
    for id in order {
        let Some(task) = graph.tasks.get(id) else {
            continue;
        };

        if task.loaded_from_cache || task.artifact.is_empty() {
            continue;
        }

        match &task.condition {
            Some(condition) => pipeline.push(Step::Branch {
                condition: condition.clone(),
                body: task.artifact.units().to_vec(),
            }),
            None => {
                for unit in task.artifact.units() {
                    pipeline.push(Step::Unit(unit.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::Value;
    use crate::pipeline::{Condition, Unit};
    use crate::task::producer;

    use super::*;

    #[test]
    fn test_conditional_artifacts_merge_as_a_branch() {
        let mut graph = Graph::new();

        graph
            .task("plain")
            .produced_by(producer(std::iter::empty::<&str>(), |scope, _| {
                scope.add_unit(Unit::new("select"));
                scope.add_unit(Unit::new("combine"));
                Ok(Value::None)
            }))
            .unwrap();
        graph
            .task("gated")
            .produced_by(producer(std::iter::empty::<&str>(), |scope, _| {
                scope.add_unit(Unit::new("match"));
                scope.set_condition("EventType", "==0");
                Ok(Value::None)
            }))
            .unwrap();

        let mut scratch = Pipeline::new();
        graph.resolve(&mut scratch, 1).unwrap();

        let order: Vec<ArcStr> = ["plain", "gated"].into_iter().map(ArcStr::from).collect();
        let mut pipeline = Pipeline::new();
        into_pipeline(&graph, &order, &mut pipeline);

        assert_eq!(pipeline.len(), 3);
        match &pipeline.steps()[2] {
            Step::Branch { condition, body } => {
                assert_eq!(condition, &Condition::new("EventType", "==0"));
                assert_eq!(body.len(), 1);
            }
            step => panic!("expected a branch, got {step:?}"),
        }
    }

    #[test]
    fn test_restored_tasks_contribute_nothing() {
        let mut graph = Graph::new();

        graph
            .task("restored")
            .produced_by(producer(std::iter::empty::<&str>(), |scope, _| {
                scope.add_unit(Unit::new("select"));
                Ok(Value::None)
            }))
            .unwrap();

        let mut scratch = Pipeline::new();
        graph.resolve(&mut scratch, 1).unwrap();
        graph.set_loaded_from_cache("restored");

        let order: Vec<ArcStr> = vec![ArcStr::from("restored")];
        let mut pipeline = Pipeline::new();
        into_pipeline(&graph, &order, &mut pipeline);

        assert!(pipeline.is_empty());
    }
}

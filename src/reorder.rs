use std::collections::HashSet;

use crate::core::ArcStr;
use crate::graph::Graph;

/// Push concurrency-unsafe tasks as late as possible in the needed list
/// without violating dependency order.
///
/// The input arrives in dependency-respecting (chain) order. A task is safe
/// when every unit of its artifact carries the parallel-safe flag. For each
/// unsafe task, every safe task behind it that does not require anything it
/// would jump over is hoisted immediately before it; the sweep repeats until
/// a full pass moves nothing. Only safe tasks ever move forward, so every
/// move strictly reduces the count of unsafe-before-safe pairs and the loop
/// terminates.
pub(crate) fn by_safety(graph: &Graph, mut order: Vec<ArcStr>) -> Vec<ArcStr> {
    let is_safe = |id: &ArcStr| {
        graph
            .tasks
            .get(id)
            .is_none_or(|task| task.artifact.is_parallel_safe())
    };

    if order.iter().all(&is_safe) {
        return order;
    }

    loop {
        let mut moved = false;
        let mut target = 0;

        while target < order.len() {
            if is_safe(&order[target]) {
                target += 1;
                continue;
            }

            // Hoist every safe task behind this unsafe one that does not
            // require anything between the two positions.
            let mut cursor = target + 1;
            while cursor < order.len() {
                if is_safe(&order[cursor]) && can_hoist(graph, &order, target, cursor) {
                    let task = order.remove(cursor);
                    order.insert(target, task);
                    target += 1;
                    moved = true;
                }
                cursor += 1;
            }

            target += 1;
        }

        if !moved {
            break;
        }
    }

    order
}

/// Whether the safe task at `cursor` may legally move to immediately before
/// the unsafe task at `target`: nothing it would jump over produces a value
/// it requires.
fn can_hoist(graph: &Graph, order: &[ArcStr], target: usize, cursor: usize) -> bool {
    let Some(task) = graph.tasks.get(&order[cursor]) else {
        return false;
    };

    let requires: HashSet<&ArcStr> = task.requires.iter().collect();
    order[target..cursor].iter().all(|id| !requires.contains(id))
}

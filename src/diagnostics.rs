use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io;

use console::style;
use petgraph::graph::NodeIndex;

use crate::core::ArcStr;
use crate::graph::Graph;
use crate::resolver::SENTINEL;

/// Render a text report of every task without a trusted value, together
/// with the requirements blocking it.
///
/// Tasks are listed in registration order. A task whose requirements are
/// all satisfied but which withheld its value shows up as deferred; within
/// one resolve call that is indistinguishable from a true cycle, so the
/// report is what lets a human tell the two apart.
pub fn render_unmet(graph: &Graph) -> String {
    let resolved: HashSet<&ArcStr> = graph
        .tasks
        .values()
        .filter(|task| task.value.is_some() && !task.halt)
        .map(|task| &task.id)
        .collect();

    let mut output = String::new();

    for id in &graph.order {
        let Some(task) = graph.tasks.get(id) else {
            continue;
        };

        if resolved.contains(id) {
            continue;
        }

        let unmet: Vec<&str> = task
            .requires
            .iter()
            .filter(|req| req.as_ref() != SENTINEL && !resolved.contains(req))
            .map(|req| req.as_ref())
            .collect();

        if unmet.is_empty() {
            let _ = writeln!(output, "{id} deferred itself (not ready yet)");
        } else {
            let _ = writeln!(output, "{id} is blocked by: {}", unmet.join(", "));
        }
    }

    if output.is_empty() {
        output.push_str("every task produced a value\n");
    }

    output
}

/// Write the unmet-requirements report to a caller-specified sink.
pub fn write_unmet<W: io::Write>(graph: &Graph, sink: &mut W) -> io::Result<()> {
    sink.write_all(render_unmet(graph).as_bytes())
}

/// Print the unmet-requirements report to stderr.
pub fn print_unmet(graph: &Graph) {
    eprintln!("{}", style("Unresolved tasks").red());
    eprint!("{}", render_unmet(graph));
}

/// Render the needed-task dependency structure as a Mermaid flowchart.
pub fn render_needed_graph(graph: &Graph) -> String {
    let mut dag: petgraph::Graph<&str, ()> = petgraph::Graph::new();
    let mut indices: HashMap<&ArcStr, NodeIndex> = HashMap::new();

    for id in &graph.order {
        if let Some(task) = graph.tasks.get(id)
            && task.needed
        {
            indices.insert(&task.id, dag.add_node(id.as_ref()));
        }
    }

    for id in &graph.order {
        let Some(task) = graph.tasks.get(id) else {
            continue;
        };
        let Some(&target) = indices.get(&task.id) else {
            continue;
        };

        for req in &task.requires {
            if let Some(&source) = indices.get(req) {
                dag.add_edge(source, target, ());
            }
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "graph LR");

    for index in dag.node_indices() {
        let name = dag[index].replace('"', "\\\""); // Simple escape
        let _ = writeln!(output, "    {:?}[\"{}\"]", index.index(), name);
    }

    for edge in dag.edge_indices() {
        let (source, target) = dag.edge_endpoints(edge).unwrap();
        let _ = writeln!(output, "    {:?} --> {:?}", source.index(), target.index());
    }

    output
}

/// Write the needed-task graph export to a caller-specified sink.
pub fn write_needed_graph<W: io::Write>(graph: &Graph, sink: &mut W) -> io::Result<()> {
    sink.write_all(render_needed_graph(graph).as_bytes())
}

#[cfg(test)]
mod tests {
    use crate::core::Value;
    use crate::pipeline::Pipeline;
    use crate::task::producer;

    use super::*;

    #[test]
    fn test_blocked_tasks_are_reported_with_their_requirements() {
        let mut graph = Graph::new();

        graph
            .task("stuck")
            .produced_by(producer(std::iter::empty::<&str>(), |scope, _| {
                scope.halt();
                Ok(Value::None)
            }))
            .unwrap();
        graph
            .task("downstream")
            .input("stuck", "stuck")
            .produced_by(producer(["stuck"], |_, _| Ok(Value::Int(1))))
            .unwrap();

        let mut pipeline = Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();

        let report = render_unmet(&graph);
        assert!(report.contains("stuck deferred itself"));
        assert!(report.contains("downstream is blocked by: stuck"));
    }

    #[test]
    fn test_complete_graph_reports_nothing_unmet() {
        let mut graph = Graph::new();
        graph.add_value("x", Value::Int(1)).unwrap();

        let mut pipeline = Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();

        assert_eq!(render_unmet(&graph), "every task produced a value\n");
    }

    #[test]
    fn test_needed_graph_exports_nodes_and_edges() {
        let mut graph = Graph::new();

        graph.add_value("base", Value::Int(1)).unwrap();
        graph
            .task("top")
            .input("base", "base")
            .produced_by(producer(["base"], |_, _| Ok(Value::Int(2))))
            .unwrap();
        graph.mark_needed("top");

        let mut pipeline = Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();

        let rendered = render_needed_graph(&graph);
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("[\"base\"]"));
        assert!(rendered.contains("[\"top\"]"));
        assert!(rendered.contains("-->"));
    }
}

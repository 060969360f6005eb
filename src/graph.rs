use std::collections::HashMap;

use crate::core::{ArcStr, Environment, Value};
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::task::{Producer, Provider, Requirement, Task};
use crate::{merge, needed, reorder, resolver};

/// The task registry and run-wide configuration.
///
/// A `Graph` is populated through the registration API ([`Graph::task`],
/// [`Graph::add`], [`Graph::add_value`]), seeded with externally-needed
/// identifiers via [`Graph::mark_needed`], and executed with
/// [`Graph::resolve`]. Instantiate a fresh one per run; the engine keeps no
/// process-wide state.
pub struct Graph {
    pub(crate) tasks: HashMap<ArcStr, Task>,
    /// Insertion order, relevant only for diagnostics and wave scans.
    pub(crate) order: Vec<ArcStr>,
    /// Identifiers flagged as needed from the outside.
    pub(crate) flagged: Vec<ArcStr>,
    /// Run-wide configuration, re-attached to checkpoint-restored tasks.
    pub env: Environment,
}

impl Graph {
    pub fn new() -> Self {
        Self::with_env(Environment::new())
    }

    pub fn with_env(env: Environment) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            flagged: Vec::new(),
            env,
        }
    }

    /// The entry point for registering a task. Returns a definition builder
    /// which is finished with [`TaskDef::produced_by`] or [`TaskDef::value`].
    pub fn task(&mut self, id: impl Into<ArcStr>) -> TaskDef<'_> {
        TaskDef {
            graph: self,
            id: id.into(),
            positional: Vec::new(),
            keyword: Vec::new(),
        }
    }

    /// Register a task with no extra requirements beyond the producer's
    /// declared inputs.
    pub fn add(
        &mut self,
        id: impl Into<ArcStr>,
        producer: impl Producer + 'static,
    ) -> Result<(), EngineError> {
        self.task(id).produced_by(producer)
    }

    /// Register a plain value under an identifier.
    pub fn add_value(
        &mut self,
        id: impl Into<ArcStr>,
        value: impl Into<Value>,
    ) -> Result<(), EngineError> {
        self.task(id).value(value)
    }

    /// Flag an identifier as needed in the final output. The transitive
    /// closure over its requirements is computed during [`Graph::resolve`].
    /// Unknown identifiers are tolerated here and surface as an incomplete
    /// resolution instead.
    pub fn mark_needed(&mut self, id: impl Into<ArcStr>) {
        let id = id.into();

        if let Some(task) = self.tasks.get_mut(&id) {
            task.needed = true;
        }

        if !self.flagged.contains(&id) {
            self.flagged.push(id);
        }
    }

    /// Value produced by a task, if it has one.
    pub fn value(&self, id: &str) -> Option<&Value> {
        self.tasks.get(id).and_then(|task| task.value.as_ref())
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Execute the graph and assemble the output pipeline.
    ///
    /// Runs the wavefront resolver, expands the needed closure, reorders the
    /// needed list for concurrency safety, and merges the surviving
    /// artifacts into `pipeline`, also on incomplete runs, since a
    /// partially assembled pipeline is exactly what makes halted
    /// prerequisites progress. Callers re-invoke once those change.
    pub fn resolve(
        &mut self,
        pipeline: &mut Pipeline,
        concurrency: usize,
    ) -> Result<Resolution, EngineError> {
        // Re-assert external flags; a checkpoint restore may have replaced
        // the flag state of individual tasks.
        for id in &self.flagged {
            if let Some(task) = self.tasks.get_mut(id) {
                task.needed = true;
            }
        }

        let state = resolver::run(self, concurrency)?;

        let missing_needed: Vec<ArcStr> = self
            .flagged
            .iter()
            .filter(|id| !state.results.contains_key(*id))
            .cloned()
            .collect();
        let complete = state.chain.len() == self.order.len() && missing_needed.is_empty();

        let needed = needed::expand(self, &state.chain);
        let ordered = reorder::by_safety(self, needed);
        merge::into_pipeline(self, &ordered, pipeline);

        if !complete {
            tracing::warn!(
                dispatched = state.chain.len(),
                total = self.order.len(),
                missing = missing_needed.len(),
                "resolution incomplete, re-invoke once halted prerequisites change"
            );
        }

        Ok(Resolution {
            complete,
            dispatched: state.chain.len(),
            total: self.order.len(),
            missing_needed,
        })
    }

    fn register(
        &mut self,
        id: ArcStr,
        producer: Provider,
        positional: Vec<Requirement>,
        keyword: Vec<(String, Requirement)>,
    ) -> Result<(), EngineError> {
        if self.tasks.contains_key(&id) {
            return Err(EngineError::DuplicateIdentifier(id));
        }

        let task = Task::new(id.clone(), producer, positional, keyword);
        self.tasks.insert(id.clone(), task);
        self.order.push(id);

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn task_needed(&self, id: &str) -> Option<bool> {
        self.tasks.get(id).map(|task| task.needed)
    }

    #[cfg(test)]
    pub(crate) fn set_loaded_from_cache(&mut self, id: &str) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.loaded_from_cache = true;
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("tasks", &self.order.len())
            .field("flagged", &self.flagged)
            .finish()
    }
}

/// Builder for a single task definition.
///
/// Positional requirements ([`TaskDef::requires`]) constrain scheduling
/// without feeding a producer input; keyword requirements
/// ([`TaskDef::input`]) bind a declared input name to the identifier that
/// supplies it. Declared inputs with neither become automatic requirements
/// matched by name.
pub struct TaskDef<'a> {
    graph: &'a mut Graph,
    id: ArcStr,
    positional: Vec<Requirement>,
    keyword: Vec<(String, Requirement)>,
}

impl TaskDef<'_> {
    /// Require another task to resolve first.
    pub fn requires(mut self, id: impl Into<String>) -> Self {
        self.positional.push(Requirement::One(id.into()));
        self
    }

    /// Require a whole list of tasks to resolve first.
    pub fn requires_all<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.positional
            .push(Requirement::Many(ids.into_iter().map(Into::into).collect()));
        self
    }

    /// Bind the declared input `name` to the identifier supplying it.
    pub fn input(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.keyword
            .push((name.into(), Requirement::One(id.into())));
        self
    }

    /// Bind the declared input `name` to an ordered list of identifiers;
    /// the producer receives their values as a single sequence.
    pub fn input_list<I, S>(mut self, name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyword.push((
            name.into(),
            Requirement::Many(ids.into_iter().map(Into::into).collect()),
        ));
        self
    }

    /// Finish the definition with a computed producer.
    pub fn produced_by(self, producer: impl Producer + 'static) -> Result<(), EngineError> {
        self.graph.register(
            self.id,
            Provider::Computed(std::sync::Arc::new(producer)),
            self.positional,
            self.keyword,
        )
    }

    /// Finish the definition with a plain value.
    pub fn value(self, value: impl Into<Value>) -> Result<(), EngineError> {
        self.graph.register(
            self.id,
            Provider::Static(value.into()),
            self.positional,
            self.keyword,
        )
    }
}

/// The outcome of a resolve call, returned as data.
///
/// An incomplete resolution is not an error: tasks deferring themselves are
/// normal control flow, and the caller is expected to re-invoke
/// [`Graph::resolve`] once their preconditions change.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Every registered task was dispatched and every externally-flagged
    /// needed identifier produced a value.
    pub complete: bool,
    /// Tasks dispatched this call, halted ones included.
    pub dispatched: usize,
    /// Registered tasks in the graph.
    pub total: usize,
    /// Externally-flagged identifiers that did not produce a value.
    pub missing_needed: Vec<std::sync::Arc<str>>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::task::producer;

    use super::*;

    fn sum_graph() -> Graph {
        let mut graph = Graph::new();

        graph
            .task("A")
            .produced_by(producer(std::iter::empty::<&str>(), |_, _| Ok(Value::Int(1))))
            .unwrap();
        graph
            .task("B")
            .input("a", "A")
            .produced_by(producer(["a"], |_, inputs| {
                Ok(Value::Int(inputs.get("a").as_int().unwrap() + 1))
            }))
            .unwrap();
        graph
            .task("C")
            .input("a", "A")
            .input("b", "B")
            .produced_by(producer(["a", "b"], |_, inputs| {
                let a = inputs.get("a").as_int().unwrap();
                let b = inputs.get("b").as_int().unwrap();
                Ok(Value::Int(a + b))
            }))
            .unwrap();

        graph
    }

    #[test]
    fn test_duplicate_identifier_is_rejected() {
        let mut graph = Graph::new();
        graph.add_value("x", Value::Int(1)).unwrap();

        let err = graph.add_value("x", Value::Int(2)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateIdentifier(_)));
    }

    #[test]
    fn test_dependent_sums_resolve_in_waves() {
        let mut graph = sum_graph();
        graph.mark_needed("C");

        let mut pipeline = Pipeline::new();
        let resolution = graph.resolve(&mut pipeline, 1).unwrap();

        assert!(resolution.complete);
        assert_eq!(graph.value("A"), Some(&Value::Int(1)));
        assert_eq!(graph.value("B"), Some(&Value::Int(2)));
        assert_eq!(graph.value("C"), Some(&Value::Int(3)));

        // Needed closure covers the whole chain.
        assert_eq!(graph.task_needed("A"), Some(true));
        assert_eq!(graph.task_needed("B"), Some(true));
        assert_eq!(graph.task_needed("C"), Some(true));
    }

    #[test]
    fn test_halted_task_defers_and_recovers() {
        let gate = Arc::new(AtomicBool::new(false));

        let mut graph = Graph::new();
        let observed = gate.clone();
        graph
            .task("D")
            .produced_by(producer(std::iter::empty::<&str>(), move |scope, _| {
                if !observed.load(Ordering::SeqCst) {
                    scope.halt();
                    return Ok(Value::None);
                }
                Ok(Value::Int(42))
            }))
            .unwrap();
        graph.mark_needed("D");

        let mut pipeline = Pipeline::new();
        let first = graph.resolve(&mut pipeline, 1).unwrap();
        assert!(!first.complete);
        assert_eq!(first.missing_needed.len(), 1);

        gate.store(true, Ordering::SeqCst);

        let second = graph.resolve(&mut pipeline, 1).unwrap();
        assert!(second.complete);
        assert_eq!(graph.value("D"), Some(&Value::Int(42)));
    }

    #[test]
    fn test_invalidation_propagates_through_requires() {
        let mut graph = Graph::new();

        graph
            .task("G")
            .input("seed", "seed")
            .produced_by(producer(["seed"], |_, inputs| {
                Ok(Value::Int(inputs.get("seed").as_int().unwrap() * 10))
            }))
            .unwrap();
        let cell = Arc::new(std::sync::atomic::AtomicI64::new(1));
        let source = cell.clone();
        graph
            .task("seed")
            .produced_by(producer(std::iter::empty::<&str>(), move |_, _| {
                Ok(Value::Int(source.load(Ordering::SeqCst)))
            }))
            .unwrap();

        for id in ["E", "F"] {
            graph
                .task(id)
                .input("g", "G")
                .produced_by(producer(["g"], |_, inputs| {
                    Ok(Value::Int(inputs.get("g").as_int().unwrap() + 1))
                }))
                .unwrap();
        }

        let mut pipeline = Pipeline::new();
        graph.resolve(&mut pipeline, 1).unwrap();
        assert_eq!(graph.value("E"), Some(&Value::Int(11)));

        // Change the external input and invalidate the leaf; the new seed
        // value then re-hashes G, E and F in one call.
        cell.store(5, Ordering::SeqCst);
        graph.tasks.get_mut("seed").unwrap().hash = None;

        graph.resolve(&mut pipeline, 1).unwrap();

        assert_eq!(graph.value("G"), Some(&Value::Int(50)));
        assert_eq!(graph.value("E"), Some(&Value::Int(51)));
        assert_eq!(graph.value("F"), Some(&Value::Int(51)));
    }

    #[test]
    fn test_unknown_needed_identifier_reports_incomplete() {
        let mut graph = sum_graph();
        graph.mark_needed("missing");

        let mut pipeline = Pipeline::new();
        let resolution = graph.resolve(&mut pipeline, 1).unwrap();

        assert!(!resolution.complete);
        assert_eq!(resolution.dispatched, resolution.total);
        assert_eq!(resolution.missing_needed, vec![ArcStr::from("missing")]);
    }

    #[test]
    fn test_sentinel_requirement_is_always_ready() {
        let mut graph = Graph::new();

        graph
            .task("opt")
            .input("extra", crate::resolver::SENTINEL)
            .produced_by(producer(["extra"], |_, inputs| {
                assert!(inputs.get("extra").is_none());
                Ok(Value::Int(1))
            }))
            .unwrap();

        let mut pipeline = Pipeline::new();
        let resolution = graph.resolve(&mut pipeline, 1).unwrap();

        assert!(resolution.complete);
        assert_eq!(graph.value("opt"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_parallel_resolve_matches_sequential() {
        let mut sequential = sum_graph();
        let mut parallel = sum_graph();
        sequential.mark_needed("C");
        parallel.mark_needed("C");

        let mut first = Pipeline::new();
        let mut second = Pipeline::new();

        let a = sequential.resolve(&mut first, 1).unwrap();
        let b = parallel.resolve(&mut second, 4).unwrap();

        assert_eq!(a.complete, b.complete);
        assert_eq!(a.dispatched, b.dispatched);

        for id in ["A", "B", "C"] {
            assert_eq!(sequential.value(id), parallel.value(id));
        }
    }

    #[test]
    fn test_producer_error_carries_the_task_identifier() {
        let mut graph = Graph::new();
        graph
            .task("broken")
            .produced_by(producer(std::iter::empty::<&str>(), |_, _| {
                anyhow::bail!("input file is unreadable")
            }))
            .unwrap();

        let mut pipeline = Pipeline::new();
        let err = graph.resolve(&mut pipeline, 1).unwrap_err();

        match err {
            EngineError::Producer { task, .. } => assert_eq!(task.as_ref(), "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{ArcStr, Environment, Hash32, Value, hash_values};
use crate::error::EngineError;
use crate::pipeline::{Condition, Fragment, Unit};

static NONE: Value = Value::None;

/// The callable side of a task.
///
/// Producers publish an explicit, ordered input contract instead of relying
/// on runtime reflection: every name returned by `declared_inputs` is
/// resolved against the results map, through a keyword requirement when the
/// task declares one for that name, by identifier name-matching otherwise.
pub trait Producer: Send + Sync {
    /// Ordered names of the inputs this producer consumes.
    fn declared_inputs(&self) -> Vec<String>;

    /// Compute the task's value.
    ///
    /// The scope is the producer's window into its own task: it can append
    /// units to the artifact, defer the task with [`Scope::halt`], and set
    /// the needed/cache/condition flags. Returning `Value::None` is the
    /// idiomatic "nothing yet".
    fn produce(&self, scope: &mut Scope<'_>, inputs: &Inputs) -> anyhow::Result<Value>;
}

/// Producer function pointer used together with an explicit input contract.
/// The callable type is erased behind `dyn Producer`.
struct FnProducer<F> {
    inputs: Vec<String>,
    func: F,
}

impl<F> Producer for FnProducer<F>
where
    F: Fn(&mut Scope<'_>, &Inputs) -> anyhow::Result<Value> + Send + Sync,
{
    fn declared_inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn produce(&self, scope: &mut Scope<'_>, inputs: &Inputs) -> anyhow::Result<Value> {
        (self.func)(scope, inputs)
    }
}

impl<F> Debug for FnProducer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Producer(*)")
    }
}

/// Wrap a closure and its input contract into a [`Producer`].
///
/// # Example
///
/// ```rust
/// use wavegraph::{producer, Value};
///
/// let double = producer(["count"], |_scope, inputs| {
///     let count = inputs.get("count").as_int().unwrap_or(0);
///     Ok(Value::Int(count * 2))
/// });
/// ```
pub fn producer<I, S, F>(inputs: I, func: F) -> impl Producer
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    F: Fn(&mut Scope<'_>, &Inputs) -> anyhow::Result<Value> + Send + Sync,
{
    FnProducer {
        inputs: inputs.into_iter().map(Into::into).collect(),
        func,
    }
}

/// "Value vs. callable" polymorphism, made explicit.
#[derive(Clone)]
pub(crate) enum Provider {
    /// A plain value registered directly into the graph.
    Static(Value),
    /// A producer invoked once its requirements are resolved.
    Computed(Arc<dyn Producer>),
}

impl Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Static(value) => write!(f, "Static({value:?})"),
            Provider::Computed(_) => write!(f, "Computed(*)"),
        }
    }
}

/// A requirement on one identifier, or on an ordered list of identifiers
/// whose values are delivered as a single sequence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Requirement {
    One(String),
    Many(Vec<String>),
}

impl Requirement {
    pub(crate) fn identifiers(&self) -> &[String] {
        match self {
            Requirement::One(id) => std::slice::from_ref(id),
            Requirement::Many(ids) => ids,
        }
    }
}

/// The resolved parameter mapping handed to a producer.
pub struct Inputs {
    values: BTreeMap<String, Value>,
}

impl Inputs {
    fn build(bindings: &[(String, Requirement)], results: &HashMap<ArcStr, Value>) -> Self {
        let mut values = BTreeMap::new();

        for (name, requirement) in bindings {
            let value = match requirement {
                Requirement::One(id) => results.get(id.as_str()).cloned().unwrap_or_default(),
                Requirement::Many(ids) => Value::Seq(
                    ids.iter()
                        .map(|id| results.get(id.as_str()).cloned().unwrap_or_default())
                        .collect(),
                ),
            };
            values.insert(name.clone(), value);
        }

        Self { values }
    }

    /// Look up an input by its declared name. Unknown names resolve to
    /// [`Value::None`].
    pub fn get(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&NONE)
    }
}

/// The producer's window into its own task during an invocation.
pub struct Scope<'a> {
    /// Run-wide configuration, read-only.
    pub env: &'a Environment,
    hash: &'a str,
    artifact: &'a mut Fragment,
    halt: &'a mut bool,
    needed: &'a mut bool,
    cache: &'a mut bool,
    condition: &'a mut Option<Condition>,
}

impl Scope<'_> {
    /// Hex digest of the current requirement values, stable across runs
    /// with identical inputs. Useful for content-addressed names.
    pub fn hash(&self) -> &str {
        self.hash
    }

    /// Append a unit to this task's artifact.
    pub fn add_unit(&mut self, unit: Unit) {
        self.artifact.push(unit);
    }

    /// Defer this task: its value is withheld from the results map and the
    /// producer runs again on the next resolve call.
    pub fn halt(&mut self) {
        *self.halt = true;
    }

    /// Flag this task's artifact as required in the merged output.
    pub fn mark_needed(&mut self) {
        *self.needed = true;
    }

    /// Flag this task's state for checkpoint persistence.
    pub fn keep_cached(&mut self) {
        *self.cache = true;
    }

    /// Gate this task's artifact behind a conditional branch keyed on a
    /// named runtime value.
    pub fn set_condition(&mut self, key: impl Into<String>, predicate: impl Into<String>) {
        *self.condition = Some(Condition::new(key, predicate));
    }
}

/// A uniquely identified unit of schedulable work.
pub(crate) struct Task {
    pub(crate) id: ArcStr,
    producer: Provider,
    /// Producer parameter name → requirement supplying it.
    bindings: Vec<(String, Requirement)>,
    /// Flattened, deduplicated, sorted union of every requirement.
    pub(crate) requires: Vec<ArcStr>,
    pub(crate) value: Option<Value>,
    pub(crate) hash: Option<Hash32>,
    pub(crate) halt: bool,
    pub(crate) needed: bool,
    pub(crate) cache: bool,
    pub(crate) condition: Option<Condition>,
    pub(crate) artifact: Fragment,
    pub(crate) loaded_from_cache: bool,
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.id)
    }
}

impl Task {
    pub(crate) fn new(
        id: ArcStr,
        producer: Provider,
        positional: Vec<Requirement>,
        keyword: Vec<(String, Requirement)>,
    ) -> Self {
        let mut bindings = Vec::new();
        // Requirements that constrain scheduling without feeding a parameter.
        let mut constraints = positional;

        match &producer {
            Provider::Computed(callable) => {
                let mut keyword: BTreeMap<String, Requirement> = keyword.into_iter().collect();

                for name in callable.declared_inputs() {
                    let requirement = keyword
                        .remove(&name)
                        .unwrap_or_else(|| Requirement::One(name.clone()));
                    bindings.push((name, requirement));
                }

                // Keyword requirements the producer does not consume still
                // constrain scheduling.
                constraints.extend(keyword.into_values());
            }
            Provider::Static(_) => {
                constraints.extend(keyword.into_iter().map(|(_, requirement)| requirement));
            }
        }

        let mut requires: Vec<ArcStr> = bindings
            .iter()
            .map(|(_, requirement)| requirement)
            .chain(constraints.iter())
            .flat_map(Requirement::identifiers)
            .map(|id| ArcStr::from(id.as_str()))
            .collect();
        requires.sort();
        requires.dedup();

        Self {
            id,
            producer,
            bindings,
            requires,
            value: None,
            hash: None,
            halt: false,
            needed: false,
            cache: false,
            condition: None,
            artifact: Fragment::default(),
            loaded_from_cache: false,
        }
    }

    /// Clone the values this task needs out of the shared results map.
    /// This is the only read a worker performs under the results lock.
    pub(crate) fn snapshot_inputs(
        &self,
        results: &HashMap<ArcStr, Value>,
    ) -> HashMap<ArcStr, Value> {
        self.requires
            .iter()
            .filter_map(|id| {
                results
                    .get(id)
                    .map(|value| (id.clone(), value.clone()))
            })
            .collect()
    }

    /// Execute this task against a snapshot of the results map.
    ///
    /// A stored value is trusted (the producer is not called) only when
    /// the task is not halted and the fresh digest of its requirement
    /// values matches the stored one. Static providers store their value
    /// directly and participate in no hashing.
    pub(crate) fn invoke(
        &mut self,
        results: &HashMap<ArcStr, Value>,
        env: &Environment,
    ) -> Result<(), EngineError> {
        let callable = match &self.producer {
            Provider::Static(value) => {
                self.value = Some(value.clone());
                return Ok(());
            }
            Provider::Computed(callable) => callable.clone(),
        };

        let mut ordered = Vec::with_capacity(self.requires.len());
        for id in &self.requires {
            match results.get(id) {
                Some(value) => ordered.push(value),
                None => {
                    return Err(EngineError::MissingDependency {
                        task: self.id.clone(),
                        dependency: id.clone(),
                    });
                }
            }
        }

        let fresh = hash_values(ordered);
        let rerun_forced = env.rerun_cached && self.loaded_from_cache;

        if self.value.is_some() && !self.halt && self.hash == Some(fresh) && !rerun_forced {
            tracing::debug!(task = %self.id, "requirement hash unchanged, reusing stored value");
            return Ok(());
        }

        if self.loaded_from_cache && self.hash.is_some() && self.hash != Some(fresh) {
            tracing::warn!(task = %self.id, "checkpoint hash mismatch, discarding restored value");
            self.value = None;
        }

        self.halt = false;
        self.artifact.clear();
        self.condition = None;

        let inputs = Inputs::build(&self.bindings, results);
        let hash_hex = fresh.to_hex();

        let mut scope = Scope {
            env,
            hash: &hash_hex,
            artifact: &mut self.artifact,
            halt: &mut self.halt,
            needed: &mut self.needed,
            cache: &mut self.cache,
            condition: &mut self.condition,
        };

        let produced =
            callable
                .produce(&mut scope, &inputs)
                .map_err(|source| EngineError::Producer {
                    task: self.id.clone(),
                    source,
                })?;

        self.value = Some(produced);
        // Stored even when the producer halted, so identical inputs are
        // recognized next time.
        self.hash = Some(fresh);
        self.loaded_from_cache = false;

        Ok(())
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::mpsc::channel;

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, Value};
use crate::error::EngineError;
use crate::graph::Graph;
use crate::task::Task;

/// Identifier of the pre-seeded null sentinel. A requirement on this name is
/// always satisfied and resolves to [`Value::None`], which lets producers
/// declare optional inputs.
pub const SENTINEL: &str = "None";

/// Everything a single resolve call accumulated.
pub(crate) struct ResolveState {
    /// Identifier → value for every task that produced one.
    pub(crate) results: HashMap<ArcStr, Value>,
    /// Tasks dispatched this call, halted ones included, in dispatch order.
    pub(crate) chain: Vec<ArcStr>,
}

/// Drive dependency-respecting wavefronts until no task is ready.
///
/// Each wave collects every task whose requirements are all present in the
/// results map, dispatches it (in parallel when `concurrency > 1`), then
/// registers the values of the non-halted ones. When `ready` comes up empty
/// while tasks remain un-dispatched, the loop simply stops: a legitimately
/// halted prerequisite is indistinguishable, within one call, from a
/// permanently blocked one, so incompleteness is reported as data.
pub(crate) fn run(graph: &mut Graph, concurrency: usize) -> Result<ResolveState, EngineError> {
    let mut results: HashMap<ArcStr, Value> = HashMap::new();
    results.insert(ArcStr::from(SENTINEL), Value::None);

    let mut chain: Vec<ArcStr> = Vec::new();
    let mut dispatched: HashSet<ArcStr> = HashSet::new();
    let total = graph.order.len();

    let root_span = tracing::span!(Level::INFO, "resolving_tasks");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    root_span.pb_set_message("Resolving tasks...");
    let _enter = root_span.enter();

    let pool = match concurrency > 1 {
        true => Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(concurrency)
                .build()?,
        ),
        false => None,
    };

    loop {
        let ready: Vec<ArcStr> = graph
            .order
            .iter()
            .filter(|id| !results.contains_key(*id) && !dispatched.contains(*id))
            .filter(|id| {
                graph
                    .tasks
                    .get(*id)
                    .is_some_and(|task| task.requires.iter().all(|req| results.contains_key(req)))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            break;
        }

        tracing::info!(
            wave = ready.len(),
            dispatched = chain.len(),
            total,
            "dispatching wave"
        );

        match &pool {
            Some(pool) => dispatch_parallel(graph, pool, &ready, &mut results)?,
            None => dispatch_sequential(graph, &ready, &mut results)?,
        }

        for id in ready {
            root_span.pb_inc(1);
            dispatched.insert(id.clone());
            chain.push(id);
        }
    }

    tracing::info!(
        dispatched = chain.len(),
        total,
        "no further tasks are ready"
    );

    Ok(ResolveState { results, chain })
}

fn dispatch_sequential(
    graph: &mut Graph,
    wave: &[ArcStr],
    results: &mut HashMap<ArcStr, Value>,
) -> Result<(), EngineError> {
    let Graph {
        ref mut tasks,
        ref env,
        ..
    } = *graph;

    for id in wave {
        let task = tasks.get_mut(id).expect("ready task is registered");
        task.invoke(results, env)?;

        if !task.halt {
            results.insert(id.clone(), task.value.clone().unwrap_or_default());
        }
    }

    Ok(())
}

/// Dispatch one wave on a bounded worker pool.
///
/// The results map moves into a mutex for the duration of the wave. Workers
/// hold the lock only to snapshot their inputs and to register their
/// outcome; producer bodies run unlocked. Task structs travel into the
/// workers and come back over a channel, so all graph mutation stays on the
/// calling thread's side of the scope.
fn dispatch_parallel(
    graph: &mut Graph,
    pool: &rayon::ThreadPool,
    wave: &[ArcStr],
    results: &mut HashMap<ArcStr, Value>,
) -> Result<(), EngineError> {
    let Graph {
        ref mut tasks,
        ref env,
        ..
    } = *graph;

    let shared = Mutex::new(std::mem::take(results));
    let (sender, receiver) = channel::<(Task, Result<(), EngineError>)>();

    pool.scope(|s| {
        for id in wave {
            let mut task = tasks.remove(id).expect("ready task is registered");
            let sender = sender.clone();
            let shared = &shared;

            s.spawn(move |_| {
                // Coarse lock held only to snapshot inputs.
                let snapshot = {
                    let guard = shared.lock().unwrap();
                    task.snapshot_inputs(&guard)
                };

                // The producer body runs unlocked. We use AssertUnwindSafe
                // because a panicking producer only ever had access to its
                // own task and a cloned snapshot.
                let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    task.invoke(&snapshot, env)
                })) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("producer panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("producer panicked: {s}")
                        } else {
                            String::from("producer panicked with unknown payload")
                        };

                        Err(EngineError::Producer {
                            task: task.id.clone(),
                            source: anyhow::anyhow!(msg),
                        })
                    }
                };

                // Coarse lock held only to register the outcome.
                if result.is_ok() && !task.halt {
                    let mut guard = shared.lock().unwrap();
                    guard.insert(task.id.clone(), task.value.clone().unwrap_or_default());
                }

                sender.send((task, result)).unwrap();
            });
        }
    });

    // The scope waited for every worker, so the channel drains without
    // blocking once the original sender is gone.
    drop(sender);

    let mut outcome: Result<(), EngineError> = Ok(());
    for (task, result) in receiver {
        if let Err(error) = result
            && outcome.is_ok()
        {
            outcome = Err(error);
        }
        tasks.insert(task.id.clone(), task);
    }

    *results = shared.into_inner().unwrap();
    outcome
}

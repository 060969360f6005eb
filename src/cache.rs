use std::fs::{self, File};
use std::io::{BufReader, BufWriter};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Value};
use crate::error::CacheError;
use crate::graph::Graph;
use crate::pipeline::{Condition, Fragment};

/// The persistable slice of a task's state.
///
/// Producers are never serialized; on load, records are re-attached to the
/// tasks already registered under the same identifier, so the registration
/// API doubles as the producer registry.
#[derive(Debug, Serialize, Deserialize)]
struct TaskRecord {
    id: String,
    value: Option<Value>,
    hash: Option<Hash32>,
    artifact: Fragment,
    condition: Option<Condition>,
    needed: bool,
    cache: bool,
    requires: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    tasks: Vec<TaskRecord>,
}

/// Persists cache-flagged task state across process invocations.
///
/// The checkpoint is an opaque CBOR container. Saving over an existing file
/// first copies it to a numbered backup (`<path>.bkp1`, `<path>.bkp2`, …,
/// smallest unused number), so a run that goes wrong never destroys the
/// last good state.
pub struct CacheStore;

impl CacheStore {
    /// Serialize every cache-flagged task of `graph` to `path`.
    pub fn save(graph: &Graph, path: impl AsRef<Utf8Path>) -> Result<(), CacheError> {
        let path = path.as_ref();

        let records = graph
            .order
            .iter()
            .filter_map(|id| graph.tasks.get(id))
            .filter(|task| task.cache)
            .map(|task| TaskRecord {
                id: task.id.to_string(),
                value: task.value.clone(),
                hash: task.hash,
                artifact: task.artifact.clone(),
                condition: task.condition.clone(),
                needed: task.needed,
                cache: task.cache,
                requires: task.requires.iter().map(|id| id.to_string()).collect(),
            })
            .collect();

        if let Some(backup) = rotate_backup(path)? {
            tracing::info!(%path, %backup, "rotated previous checkpoint");
        }

        let file = BufWriter::new(File::create(path)?);
        ciborium::into_writer(&Checkpoint { tasks: records }, file)?;

        Ok(())
    }

    /// Restore a prior save onto the tasks registered in `graph`.
    ///
    /// Restored tasks are marked `loaded_from_cache`, which keeps their
    /// artifacts out of the merged output and (with hash agreement) their
    /// producers uncalled. Records whose identifier is not registered, or
    /// whose requirement list no longer matches the registered task, are
    /// skipped with a warning, since a changed graph invalidates them.
    /// Returns the number of restored tasks.
    pub fn load(graph: &mut Graph, path: impl AsRef<Utf8Path>) -> Result<usize, CacheError> {
        let path = path.as_ref();
        let file = BufReader::new(File::open(path)?);
        let checkpoint: Checkpoint = ciborium::from_reader(file)?;

        let mut restored = 0;

        for record in checkpoint.tasks {
            let Some(task) = graph.tasks.get_mut(record.id.as_str()) else {
                tracing::warn!(task = %record.id, "checkpoint record has no registered task, skipping");
                continue;
            };

            let requires: Vec<&str> = task.requires.iter().map(|id| id.as_ref()).collect();
            if requires != record.requires {
                tracing::warn!(task = %record.id, "checkpoint requirements differ from registration, skipping");
                continue;
            }

            task.value = record.value;
            task.hash = record.hash;
            task.artifact = record.artifact;
            task.condition = record.condition;
            task.needed = record.needed;
            task.cache = record.cache;
            task.halt = false;
            task.loaded_from_cache = true;
            restored += 1;
        }

        tracing::info!(restored, %path, "loaded checkpoint");
        Ok(restored)
    }
}

fn rotate_backup(path: &Utf8Path) -> std::io::Result<Option<Utf8PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    for n in 1u32.. {
        let backup = Utf8PathBuf::from(format!("{path}.bkp{n}"));
        if !backup.exists() {
            fs::copy(path, &backup)?;
            return Ok(Some(backup));
        }
    }

    Ok(None)
}

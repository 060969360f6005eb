use thiserror::Error;

use crate::core::ArcStr;

/// Fatal engine errors.
///
/// Business-level incompleteness is never reported here, because a task
/// deferring itself is normal control flow and surfaces as data in
/// [`crate::Resolution`]. This enum covers programmer errors and invariant
/// violations only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A task identifier was registered twice.
    #[error("duplicate task identifier '{0}'")]
    DuplicateIdentifier(ArcStr),

    /// A task was invoked before one of its requirements produced a value.
    /// Unreachable as long as the resolver dispatches correctly.
    #[error("task '{task}' invoked before requirement '{dependency}' was resolved")]
    MissingDependency { task: ArcStr, dependency: ArcStr },

    /// A producer returned an error or panicked.
    #[error("task '{task}':\n{source}")]
    Producer {
        task: ArcStr,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode checkpoint")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("failed to decode checkpoint")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

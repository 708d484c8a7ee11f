use thiserror::Error;

/// Errors surfaced by runners and multi-runners
#[derive(Debug, Error)]
pub enum Error {
    /// Neither a success nor a failure check was configured
    #[error("'success' or 'failure' is required by runner")]
    MissingOutcome,

    /// A sentinel value was configured for a check but no comparator exists to match it
    #[error("'{hook}' is a sentinel value and requires 'compare_func'")]
    SentinelWithoutComparator { hook: &'static str },

    /// Event loop could not be created
    #[error("failed to create event loop: {0}")]
    EventLoop(#[source] std::io::Error),

    /// Thread pool could not be created
    #[error("failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The operation does not apply to this execution model
    #[error("'{operation}' is not supported by the {model} runner")]
    Unsupported {
        operation: &'static str,
        model: &'static str,
    },

    /// A scheduled unit of work was cancelled before it finished
    #[error("run was interrupted before completion")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

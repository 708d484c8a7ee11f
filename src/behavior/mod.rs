//! Turns optional user callbacks into an attack strategy.
//!
//! [`Behavior`] and [`AsyncBehavior`] collect the configuration; their
//! strategies implement [`Attack`](crate::engine::Attack) and
//! [`AsyncAttack`](crate::engine::AsyncAttack). Every predicate-style item is
//! resolved the same way in both: a configured item is evaluated (through the
//! comparator when one is set), otherwise the engine heuristic applies.

mod asynchronous;
mod blocking;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{AsyncFn, Callable};
use crate::error::{Error, Result};

pub use asynchronous::{AsyncBehavior, AsyncComparator, AsyncStrategy};
pub use blocking::{Behavior, Comparator, Strategy};

/// How success is decided when only a failure check is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessFallback {
    /// Target reached and neither a failure nor a target error
    #[default]
    Derived,
    /// Sub-checks still run, but success is never inferred
    Conservative,
}

/// Predicate over a response
pub type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// A configured check: a predicate, or a sentinel matched by the comparator
pub enum Check<R> {
    Predicate(Predicate<R>),
    Value(Value),
}

impl<R> Clone for Check<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Predicate(p) => Self::Predicate(Arc::clone(p)),
            Self::Value(v) => Self::Value(v.clone()),
        }
    }
}

impl<R> Check<R> {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Predicate(_) => None,
        }
    }

    /// Calls the predicate. Sentinels have no meaning without a comparator.
    pub fn test(&self, response: &R) -> Option<bool> {
        match self {
            Self::Predicate(p) => Some(p(response)),
            Self::Value(_) => None,
        }
    }
}

/// Awaitable counterpart of [`Check`]
pub enum AsyncCheck<R> {
    Predicate(AsyncFn<Arc<R>, bool>),
    Value(Value),
}

impl<R> Clone for AsyncCheck<R> {
    fn clone(&self) -> Self {
        match self {
            Self::Predicate(p) => Self::Predicate(Arc::clone(p)),
            Self::Value(v) => Self::Value(v.clone()),
        }
    }
}

impl<R: Send + Sync + 'static> AsyncCheck<R> {
    /// Wraps blocking predicates once, here
    pub fn predicate(callable: Callable<Arc<R>, bool>) -> Self {
        Self::Predicate(callable.into_async())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Predicate(_) => None,
        }
    }

    pub async fn test(&self, response: Arc<R>) -> Option<bool> {
        match self {
            Self::Predicate(p) => Some(p(response).await),
            Self::Value(_) => None,
        }
    }
}

/// Rejects bundles that cannot decide an outcome
fn validate_checks(
    has_success: bool,
    has_failure: bool,
    has_comparator: bool,
    sentinels: impl IntoIterator<Item = (&'static str, bool)>,
) -> Result<()> {
    if !has_success && !has_failure {
        return Err(Error::MissingOutcome);
    }
    if !has_comparator {
        if let Some((hook, _)) = sentinels.into_iter().find(|(_, sentinel)| *sentinel) {
            return Err(Error::SentinelWithoutComparator { hook });
        }
    }
    Ok(())
}

//! Built-in classification used when an attack does not know better.
//!
//! These are the bodies of the default trait methods, exposed so that an
//! implementation overriding a method can still fall back to them.

use super::attack::{AsyncAttack, Attack, Attempt};

/// A response arrived and the connector did not fail
pub fn target_reached<T, R, S>(attempt: &Attempt<T, R, S>) -> bool {
    attempt.response().is_some() && attempt.error().is_none()
}

pub fn client_errors<T, R, S>(attempt: &Attempt<T, R, S>) -> bool {
    attempt.error().is_some()
}

pub fn target_errors<T, R, S>(_attempt: &Attempt<T, R, S>) -> bool {
    false
}

pub fn success<T, R, S>(_attempt: &Attempt<T, R, S>) -> bool {
    false
}

/// Reached the target but did not succeed
pub fn failure<T, R, S, A>(attack: &A, attempt: &Attempt<T, R, S>) -> bool
where
    A: Attack<T, R, S> + ?Sized,
{
    attack.target_reached(attempt) && !attack.success(attempt)
}

pub async fn failure_async<T, R, S, A>(attack: &A, attempt: &Attempt<T, R, S>) -> bool
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
    A: AsyncAttack<T, R, S> + ?Sized,
{
    attack.target_reached(attempt).await && !attack.success(attempt).await
}

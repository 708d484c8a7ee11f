use std::sync::Arc;

use async_trait::async_trait;

use super::heuristics;
use super::table::Record;

/// State of one record's attempt, including its retries
pub struct Attempt<T, R, S> {
    target: Arc<T>,
    record: Record,
    max_retries: u32,
    retries: u32,
    response: Option<Arc<R>>,
    error: Option<anyhow::Error>,
    session: Option<Arc<S>>,
    owns_session: bool,
    transformed: bool,
}

impl<T, R, S> Attempt<T, R, S> {
    pub fn new(target: Arc<T>, record: Record, max_retries: u32) -> Self {
        Self {
            target,
            record,
            max_retries,
            retries: 0,
            response: None,
            error: None,
            session: None,
            owns_session: false,
            transformed: false,
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Replaces the record for the rest of the attempt
    pub fn set_record(&mut self, record: Record) {
        self.record = record;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn response(&self) -> Option<&Arc<R>> {
        self.response.as_ref()
    }

    /// Error returned by the connector on the latest request
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub fn session(&self) -> Option<&Arc<S>> {
        self.session.as_ref()
    }

    pub fn is_transformed(&self) -> bool {
        self.transformed
    }

    pub fn mark_transformed(&mut self) {
        self.transformed = true;
    }

    fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    fn record_outcome(&mut self, outcome: anyhow::Result<R>) {
        match outcome {
            Ok(response) => {
                self.response = Some(Arc::new(response));
                self.error = None;
            }
            Err(e) => {
                self.response = None;
                self.error = Some(e);
            }
        }
    }
}

/// Lifecycle of one attempt.
///
/// Default methods are the engine's built-in heuristics. Implementors
/// override the ones they have better knowledge of.
pub trait Attack<T, R, S>: Send + Sync {
    /// Connects to the target with the attempt's record
    fn request(&self, attempt: &Attempt<T, R, S>) -> anyhow::Result<R>;

    fn target_reached(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::target_reached(attempt)
    }

    fn success(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::success(attempt)
    }

    fn failure(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::failure(self, attempt)
    }

    fn client_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::client_errors(attempt)
    }

    fn target_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::target_errors(attempt)
    }

    fn before_request(&self, _attempt: &mut Attempt<T, R, S>) {}

    fn after_request(&self, _attempt: &Attempt<T, R, S>) {}

    fn create_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        Ok(None)
    }

    fn close_session(&self, _session: Arc<S>) {}

    fn close_response(&self, _response: Arc<R>) {}

    fn max_retries(&self) -> u32 {
        0
    }
}

/// Awaitable lifecycle of one attempt, mirroring [`Attack`]
#[async_trait]
pub trait AsyncAttack<T, R, S>: Send + Sync
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn request(&self, attempt: &Attempt<T, R, S>) -> anyhow::Result<R>;

    async fn target_reached(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::target_reached(attempt)
    }

    async fn success(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::success(attempt)
    }

    async fn failure(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::failure_async(self, attempt).await
    }

    async fn client_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::client_errors(attempt)
    }

    async fn target_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        heuristics::target_errors(attempt)
    }

    async fn before_request(&self, _attempt: &mut Attempt<T, R, S>) {}

    async fn after_request(&self, _attempt: &Attempt<T, R, S>) {}

    async fn create_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        Ok(None)
    }

    async fn close_session(&self, _session: Arc<S>) {}

    async fn close_response(&self, _response: Arc<R>) {}

    fn max_retries(&self) -> u32 {
        0
    }
}

/// Runs one attempt to completion and reports whether it succeeded.
///
/// `shared` is the runner-level session; when absent the attack creates one
/// for this attempt and closes it at the end.
pub fn drive<T, R, S, A>(attack: &A, attempt: &mut Attempt<T, R, S>, shared: Option<Arc<S>>) -> bool
where
    A: Attack<T, R, S> + ?Sized,
{
    match shared {
        Some(session) => attempt.session = Some(session),
        None => match attack.create_session() {
            Ok(session) => {
                attempt.owns_session = session.is_some();
                attempt.session = session;
            }
            Err(e) => {
                attempt.error = Some(e);
                return false;
            }
        },
    }

    loop {
        attack.before_request(attempt);
        let outcome = attack.request(attempt);
        attempt.record_outcome(outcome);
        attack.after_request(attempt);

        let errored = attempt.error().is_some()
            || attack.client_errors(attempt)
            || attack.target_errors(attempt);
        if !(errored && attempt.can_retry()) {
            break;
        }
        attempt.retries += 1;
        tracing::trace!(retries = attempt.retries, "retrying attempt");
        if let Some(response) = attempt.response.take() {
            attack.close_response(response);
        }
    }

    let success = attempt.response().is_some() && attack.success(attempt);

    if let Some(response) = attempt.response.take() {
        attack.close_response(response);
    }
    if attempt.owns_session {
        if let Some(session) = attempt.session.take() {
            attack.close_session(session);
        }
    }
    success
}

/// Awaitable counterpart of [`drive`]
pub async fn drive_async<T, R, S, A>(
    attack: &A,
    attempt: &mut Attempt<T, R, S>,
    shared: Option<Arc<S>>,
) -> bool
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
    A: AsyncAttack<T, R, S> + ?Sized,
{
    match shared {
        Some(session) => attempt.session = Some(session),
        None => match attack.create_session().await {
            Ok(session) => {
                attempt.owns_session = session.is_some();
                attempt.session = session;
            }
            Err(e) => {
                attempt.error = Some(e);
                return false;
            }
        },
    }

    loop {
        attack.before_request(attempt).await;
        let outcome = attack.request(attempt).await;
        attempt.record_outcome(outcome);
        attack.after_request(attempt).await;

        let errored = attempt.error().is_some()
            || attack.client_errors(attempt).await
            || attack.target_errors(attempt).await;
        if !(errored && attempt.can_retry()) {
            break;
        }
        attempt.retries += 1;
        tracing::trace!(retries = attempt.retries, "retrying attempt");
        if let Some(response) = attempt.response.take() {
            attack.close_response(response).await;
        }
    }

    let success = attempt.response().is_some() && attack.success(attempt).await;

    if let Some(response) = attempt.response.take() {
        attack.close_response(response).await;
    }
    if attempt.owns_session {
        if let Some(session) = attempt.session.take() {
            attack.close_session(session).await;
        }
    }
    success
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{validate_checks, AsyncCheck, SuccessFallback};
use crate::adapter::{AsyncFn, AsyncSource, Callable};
use crate::engine::{heuristics, AsyncAttack, Attempt, Record};
use crate::error::Result;

type ConnectArgs<T, S> = (Arc<T>, Record, Option<Arc<S>>);
type HookArgs<R> = (Record, Option<Arc<R>>);

/// Matches a configured check against a response
pub type AsyncComparator<R> = AsyncFn<(AsyncCheck<R>, Arc<R>), bool>;

/// Callbacks for a cooperative run.
///
/// Every setter accepts blocking or awaitable callables. Blocking ones are
/// wrapped once, when they are set, so each lifecycle hook is awaited the
/// same way.
pub struct AsyncBehavior<T, R, S = ()> {
    connect: AsyncFn<ConnectArgs<T, S>, anyhow::Result<R>>,
    session: Option<AsyncSource<S>>,
    target_reached: Option<AsyncCheck<R>>,
    success: Option<AsyncCheck<R>>,
    failure: Option<AsyncCheck<R>>,
    client_error: Option<AsyncCheck<R>>,
    target_error: Option<AsyncCheck<R>>,
    compare_func: Option<AsyncComparator<R>>,
    record_transformer: Option<AsyncFn<Record, Record>>,
    before_connect: Option<AsyncFn<HookArgs<R>, ()>>,
    after_connect: Option<AsyncFn<HookArgs<R>, ()>>,
    response_closer: Option<AsyncFn<Arc<R>, ()>>,
    session_closer: Option<AsyncFn<Arc<S>, ()>>,
    max_retries: u32,
    success_fallback: SuccessFallback,
}

impl<T, R, S> AsyncBehavior<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// `connect` receives the target, the record and the attempt's session
    pub fn new(connect: Callable<ConnectArgs<T, S>, anyhow::Result<R>>) -> Self {
        Self {
            connect: connect.into_async(),
            session: None,
            target_reached: None,
            success: None,
            failure: None,
            client_error: None,
            target_error: None,
            compare_func: None,
            record_transformer: None,
            before_connect: None,
            after_connect: None,
            response_closer: None,
            session_closer: None,
            max_retries: 0,
            success_fallback: SuccessFallback::Conservative,
        }
    }

    pub fn session(mut self, session: AsyncSource<S>) -> Self {
        self.session = Some(session);
        self
    }

    /// Same session object for every attempt
    pub fn session_value(self, session: S) -> Self {
        self.session(AsyncSource::value(session))
    }

    /// Fresh session per attempt, awaited when the producer is awaitable
    pub fn session_factory(self, factory: Callable<(), anyhow::Result<S>>) -> Self {
        self.session(AsyncSource::producer(factory))
    }

    pub fn target_reached(mut self, check: Callable<Arc<R>, bool>) -> Self {
        self.target_reached = Some(AsyncCheck::predicate(check));
        self
    }

    pub fn target_reached_value(mut self, value: impl Into<Value>) -> Self {
        self.target_reached = Some(AsyncCheck::value(value));
        self
    }

    pub fn success(mut self, check: Callable<Arc<R>, bool>) -> Self {
        self.success = Some(AsyncCheck::predicate(check));
        self
    }

    pub fn success_value(mut self, value: impl Into<Value>) -> Self {
        self.success = Some(AsyncCheck::value(value));
        self
    }

    pub fn failure(mut self, check: Callable<Arc<R>, bool>) -> Self {
        self.failure = Some(AsyncCheck::predicate(check));
        self
    }

    pub fn failure_value(mut self, value: impl Into<Value>) -> Self {
        self.failure = Some(AsyncCheck::value(value));
        self
    }

    pub fn client_error(mut self, check: Callable<Arc<R>, bool>) -> Self {
        self.client_error = Some(AsyncCheck::predicate(check));
        self
    }

    pub fn client_error_value(mut self, value: impl Into<Value>) -> Self {
        self.client_error = Some(AsyncCheck::value(value));
        self
    }

    pub fn target_error(mut self, check: Callable<Arc<R>, bool>) -> Self {
        self.target_error = Some(AsyncCheck::predicate(check));
        self
    }

    pub fn target_error_value(mut self, value: impl Into<Value>) -> Self {
        self.target_error = Some(AsyncCheck::value(value));
        self
    }

    pub fn compare_func(mut self, compare: Callable<(AsyncCheck<R>, Arc<R>), bool>) -> Self {
        self.compare_func = Some(compare.into_async());
        self
    }

    pub fn record_transformer(mut self, transform: Callable<Record, Record>) -> Self {
        self.record_transformer = Some(transform.into_async());
        self
    }

    pub fn before_connect(mut self, hook: Callable<HookArgs<R>, ()>) -> Self {
        self.before_connect = Some(hook.into_async());
        self
    }

    pub fn after_connect(mut self, hook: Callable<HookArgs<R>, ()>) -> Self {
        self.after_connect = Some(hook.into_async());
        self
    }

    /// Alias of [`AsyncBehavior::after_connect`]
    pub fn after_attempt(self, hook: Callable<HookArgs<R>, ()>) -> Self {
        self.after_connect(hook)
    }

    pub fn response_closer(mut self, close: Callable<Arc<R>, ()>) -> Self {
        self.response_closer = Some(close.into_async());
        self
    }

    pub fn session_closer(mut self, close: Callable<Arc<S>, ()>) -> Self {
        self.session_closer = Some(close.into_async());
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn success_fallback(mut self, fallback: SuccessFallback) -> Self {
        self.success_fallback = fallback;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_checks(
            self.success.is_some(),
            self.failure.is_some(),
            self.compare_func.is_some(),
            [
                ("target_reached", &self.target_reached),
                ("success", &self.success),
                ("failure", &self.failure),
                ("client_error", &self.client_error),
                ("target_error", &self.target_error),
            ]
            .map(|(hook, check)| (hook, matches!(check, Some(AsyncCheck::Value(_))))),
        )
    }

    pub fn into_strategy(self) -> Result<AsyncStrategy<T, R, S>> {
        AsyncStrategy::new(self)
    }
}

/// [`AsyncAttack`] implementation resolved from an [`AsyncBehavior`]
pub struct AsyncStrategy<T, R, S = ()> {
    behavior: Arc<AsyncBehavior<T, R, S>>,
}

impl<T, R, S> Clone for AsyncStrategy<T, R, S> {
    fn clone(&self) -> Self {
        Self {
            behavior: Arc::clone(&self.behavior),
        }
    }
}

impl<T, R, S> AsyncStrategy<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(behavior: AsyncBehavior<T, R, S>) -> Result<Self> {
        behavior.validate()?;
        Ok(Self {
            behavior: Arc::new(behavior),
        })
    }

    /// `None` when the check is not configured
    async fn evaluate(&self, check: Option<&AsyncCheck<R>>, attempt: &Attempt<T, R, S>) -> Option<bool> {
        let check = check?;
        let Some(response) = attempt.response() else {
            return Some(false);
        };
        let response = Arc::clone(response);
        Some(match &self.behavior.compare_func {
            Some(compare) => compare((check.clone(), response)).await,
            None => check.test(response).await.unwrap_or(false),
        })
    }
}

#[async_trait]
impl<T, R, S> AsyncAttack<T, R, S> for AsyncStrategy<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn request(&self, attempt: &Attempt<T, R, S>) -> anyhow::Result<R> {
        let args = (
            Arc::clone(attempt.target()),
            attempt.record().clone(),
            attempt.session().cloned(),
        );
        (self.behavior.connect)(args).await
    }

    async fn target_reached(&self, attempt: &Attempt<T, R, S>) -> bool {
        match self.evaluate(self.behavior.target_reached.as_ref(), attempt).await {
            Some(reached) => reached,
            None => heuristics::target_reached(attempt),
        }
    }

    async fn success(&self, attempt: &Attempt<T, R, S>) -> bool {
        if let Some(success) = self.evaluate(self.behavior.success.as_ref(), attempt).await {
            return success;
        }
        // Validation guarantees a configured failure check past this point.
        match self.behavior.success_fallback {
            SuccessFallback::Derived => {
                self.target_reached(attempt).await
                    && !self.failure(attempt).await
                    && !self.target_errors(attempt).await
            }
            SuccessFallback::Conservative => {
                if self.target_reached(attempt).await && !self.failure(attempt).await {
                    let _ = self.target_errors(attempt).await;
                }
                false
            }
        }
    }

    async fn failure(&self, attempt: &Attempt<T, R, S>) -> bool {
        match self.evaluate(self.behavior.failure.as_ref(), attempt).await {
            Some(failed) => failed,
            None => heuristics::failure_async(self, attempt).await,
        }
    }

    async fn client_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        match self.evaluate(self.behavior.client_error.as_ref(), attempt).await {
            Some(errored) => errored,
            None => heuristics::client_errors(attempt),
        }
    }

    async fn target_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        match self.evaluate(self.behavior.target_error.as_ref(), attempt).await {
            Some(errored) => errored,
            None => heuristics::target_errors(attempt),
        }
    }

    async fn before_request(&self, attempt: &mut Attempt<T, R, S>) {
        if let Some(transform) = &self.behavior.record_transformer {
            if !attempt.is_transformed() {
                let record = transform(attempt.record().clone()).await;
                attempt.set_record(record);
                attempt.mark_transformed();
            }
        }
        if let Some(hook) = &self.behavior.before_connect {
            hook((attempt.record().clone(), attempt.response().cloned())).await;
        }
    }

    async fn after_request(&self, attempt: &Attempt<T, R, S>) {
        if let Some(hook) = &self.behavior.after_connect {
            hook((attempt.record().clone(), attempt.response().cloned())).await;
        }
    }

    async fn create_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        match &self.behavior.session {
            Some(source) => source.extract().await.map(Some),
            None => Ok(None),
        }
    }

    async fn close_session(&self, session: Arc<S>) {
        if let Some(close) = &self.behavior.session_closer {
            close(session).await;
        }
    }

    async fn close_response(&self, response: Arc<R>) {
        if let Some(close) = &self.behavior.response_closer {
            close(response).await;
        }
    }

    fn max_retries(&self) -> u32 {
        self.behavior.max_retries
    }
}

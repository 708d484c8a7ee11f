use std::sync::Arc;

use serde_json::Value;

use super::{validate_checks, Check, SuccessFallback};
use crate::adapter::Source;
use crate::engine::{heuristics, Attack, Attempt, Record};
use crate::error::Result;

type Connect<T, R, S> = Arc<dyn Fn(&T, &Record, Option<&S>) -> anyhow::Result<R> + Send + Sync>;
type Transformer = Arc<dyn Fn(Record) -> Record + Send + Sync>;
type ConnectHook<R> = Arc<dyn Fn(&Record, Option<&R>) + Send + Sync>;
type Closer<V> = Arc<dyn Fn(Arc<V>) + Send + Sync>;

/// Matches a configured check against a response
pub type Comparator<R> = Arc<dyn Fn(&Check<R>, &R) -> bool + Send + Sync>;

/// Callbacks for a blocking run
pub struct Behavior<T, R, S = ()> {
    connect: Connect<T, R, S>,
    session: Option<Source<S>>,
    target_reached: Option<Check<R>>,
    success: Option<Check<R>>,
    failure: Option<Check<R>>,
    client_error: Option<Check<R>>,
    target_error: Option<Check<R>>,
    compare_func: Option<Comparator<R>>,
    record_transformer: Option<Transformer>,
    before_connect: Option<ConnectHook<R>>,
    after_connect: Option<ConnectHook<R>>,
    response_closer: Option<Closer<R>>,
    session_closer: Option<Closer<S>>,
    max_retries: u32,
    success_fallback: SuccessFallback,
}

impl<T, R, S> Behavior<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// `connect` receives the target, the record and the attempt's session
    pub fn new<F>(connect: F) -> Self
    where
        F: Fn(&T, &Record, Option<&S>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            connect: Arc::new(connect),
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
            success_fallback: SuccessFallback::Derived,
        }
    }

    pub fn session(mut self, session: Source<S>) -> Self {
        self.session = Some(session);
        self
    }

    /// Same session object for every attempt
    pub fn session_value(self, session: S) -> Self {
        self.session(Source::value(session))
    }

    /// Fresh session per attempt
    pub fn session_factory<F>(self, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<S> + Send + Sync + 'static,
    {
        self.session(Source::producer(factory))
    }

    pub fn target_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.target_reached = Some(Check::predicate(f));
        self
    }

    pub fn target_reached_value(mut self, value: impl Into<Value>) -> Self {
        self.target_reached = Some(Check::value(value));
        self
    }

    pub fn success<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.success = Some(Check::predicate(f));
        self
    }

    pub fn success_value(mut self, value: impl Into<Value>) -> Self {
        self.success = Some(Check::value(value));
        self
    }

    pub fn failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.failure = Some(Check::predicate(f));
        self
    }

    pub fn failure_value(mut self, value: impl Into<Value>) -> Self {
        self.failure = Some(Check::value(value));
        self
    }

    pub fn client_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.client_error = Some(Check::predicate(f));
        self
    }

    pub fn client_error_value(mut self, value: impl Into<Value>) -> Self {
        self.client_error = Some(Check::value(value));
        self
    }

    pub fn target_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.target_error = Some(Check::predicate(f));
        self
    }

    pub fn target_error_value(mut self, value: impl Into<Value>) -> Self {
        self.target_error = Some(Check::value(value));
        self
    }

    /// Evaluate every configured check as `compare(check, response)`
    pub fn compare_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&Check<R>, &R) -> bool + Send + Sync + 'static,
    {
        self.compare_func = Some(Arc::new(f));
        self
    }

    /// Replaces the record once per attempt, before its first request
    pub fn record_transformer<F>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.record_transformer = Some(Arc::new(f));
        self
    }

    pub fn before_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record, Option<&R>) + Send + Sync + 'static,
    {
        self.before_connect = Some(Arc::new(f));
        self
    }

    pub fn after_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record, Option<&R>) + Send + Sync + 'static,
    {
        self.after_connect = Some(Arc::new(f));
        self
    }

    /// Alias of [`Behavior::after_connect`]
    pub fn after_attempt<F>(self, f: F) -> Self
    where
        F: Fn(&Record, Option<&R>) + Send + Sync + 'static,
    {
        self.after_connect(f)
    }

    pub fn response_closer<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<R>) + Send + Sync + 'static,
    {
        self.response_closer = Some(Arc::new(f));
        self
    }

    pub fn session_closer<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<S>) + Send + Sync + 'static,
    {
        self.session_closer = Some(Arc::new(f));
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
            .map(|(hook, check)| (hook, matches!(check, Some(Check::Value(_))))),
        )
    }

    pub fn into_strategy(self) -> Result<Strategy<T, R, S>> {
        Strategy::new(self)
    }
}

/// [`Attack`] implementation resolved from a [`Behavior`]
pub struct Strategy<T, R, S = ()> {
    behavior: Arc<Behavior<T, R, S>>,
}

impl<T, R, S> Clone for Strategy<T, R, S> {
    fn clone(&self) -> Self {
        Self {
            behavior: Arc::clone(&self.behavior),
        }
    }
}

impl<T, R, S> Strategy<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(behavior: Behavior<T, R, S>) -> Result<Self> {
        behavior.validate()?;
        Ok(Self {
            behavior: Arc::new(behavior),
        })
    }

    /// `None` when the check is not configured
    fn evaluate(&self, check: Option<&Check<R>>, attempt: &Attempt<T, R, S>) -> Option<bool> {
        let check = check?;
        let Some(response) = attempt.response() else {
            return Some(false);
        };
        Some(match &self.behavior.compare_func {
            Some(compare) => compare(check, response),
            None => check.test(response).unwrap_or(false),
        })
    }
}

impl<T, R, S> Attack<T, R, S> for Strategy<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn request(&self, attempt: &Attempt<T, R, S>) -> anyhow::Result<R> {
        let session = attempt.session().map(|s| s.as_ref());
        (self.behavior.connect)(attempt.target().as_ref(), attempt.record(), session)
    }

    fn target_reached(&self, attempt: &Attempt<T, R, S>) -> bool {
        self.evaluate(self.behavior.target_reached.as_ref(), attempt)
            .unwrap_or_else(|| heuristics::target_reached(attempt))
    }

    fn success(&self, attempt: &Attempt<T, R, S>) -> bool {
        if let Some(success) = self.evaluate(self.behavior.success.as_ref(), attempt) {
            return success;
        }
        match self.behavior.success_fallback {
            SuccessFallback::Derived => {
                self.target_reached(attempt)
                    && !(self.target_errors(attempt) || self.failure(attempt))
            }
            SuccessFallback::Conservative => {
                if self.target_reached(attempt) {
                    let _ = self.failure(attempt) || self.target_errors(attempt);
                }
                false
            }
        }
    }

    fn failure(&self, attempt: &Attempt<T, R, S>) -> bool {
        self.evaluate(self.behavior.failure.as_ref(), attempt)
            .unwrap_or_else(|| heuristics::failure(self, attempt))
    }

    fn client_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        self.evaluate(self.behavior.client_error.as_ref(), attempt)
            .unwrap_or_else(|| heuristics::client_errors(attempt))
    }

    fn target_errors(&self, attempt: &Attempt<T, R, S>) -> bool {
        self.evaluate(self.behavior.target_error.as_ref(), attempt)
            .unwrap_or_else(|| heuristics::target_errors(attempt))
    }

    fn before_request(&self, attempt: &mut Attempt<T, R, S>) {
        if let Some(transform) = &self.behavior.record_transformer {
            if !attempt.is_transformed() {
                let record = transform(attempt.record().clone());
                attempt.set_record(record);
                attempt.mark_transformed();
            }
        }
        if let Some(hook) = &self.behavior.before_connect {
            hook(attempt.record(), attempt.response().map(|r| r.as_ref()));
        }
    }

    fn after_request(&self, attempt: &Attempt<T, R, S>) {
        if let Some(hook) = &self.behavior.after_connect {
            hook(attempt.record(), attempt.response().map(|r| r.as_ref()));
        }
    }

    fn create_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        self.behavior
            .session
            .as_ref()
            .map(|source| source.extract())
            .transpose()
    }

    fn close_session(&self, session: Arc<S>) {
        if let Some(close) = &self.behavior.session_closer {
            close(session);
        }
    }

    fn close_response(&self, response: Arc<R>) {
        if let Some(close) = &self.behavior.response_closer {
            close(response);
        }
    }

    fn max_retries(&self) -> u32 {
        self.behavior.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::drive;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn record(username: &str, password: i64) -> Record {
        json!({"username": username, "password": password})
            .as_object()
            .unwrap()
            .clone()
    }

    /// Echoes the record as text
    fn echo() -> Behavior<String, String> {
        Behavior::new(|target: &String, record: &Record, _: Option<&()>| {
            Ok(format!("{} {}", target, Value::Object(record.clone())))
        })
    }

    fn run(strategy: &Strategy<String, String>, record: Record) -> (bool, Attempt<String, String, ()>) {
        let mut attempt = Attempt::new(Arc::new("target".to_string()), record, strategy.max_retries());
        let success = drive(strategy, &mut attempt, None);
        (success, attempt)
    }

    #[test]
    fn test_requires_success_or_failure() {
        assert!(matches!(echo().validate(), Err(Error::MissingOutcome)));
        assert!(echo().success(|_| true).validate().is_ok());
        assert!(echo().failure(|_| true).validate().is_ok());
    }

    #[test]
    fn test_sentinel_requires_comparator() {
        let err = echo().success_value("Ben").validate().unwrap_err();
        assert!(matches!(err, Error::SentinelWithoutComparator { hook: "success" }));

        let ok = echo()
            .success_value("Ben")
            .compare_func(|_, _| false)
            .validate();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_success_predicate() {
        let strategy = echo()
            .success(|r: &String| r.contains("\"Ben\"") && r.contains("\"password\":1"))
            .into_strategy()
            .unwrap();
        assert!(run(&strategy, record("Ben", 1)).0);
        assert!(!run(&strategy, record("Ben", 2)).0);
        assert!(!run(&strategy, record("John", 1)).0);
    }

    #[test]
    fn test_comparator_receives_sentinel() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let strategy = echo()
            .success_value("Ben")
            .compare_func(move |check: &Check<String>, response: &String| {
                let sentinel = check.as_value().and_then(Value::as_str).unwrap_or_default();
                log.lock().unwrap().push(sentinel.to_string());
                response.contains(sentinel)
            })
            .into_strategy()
            .unwrap();

        assert!(run(&strategy, record("Ben", 0)).0);
        assert!(!run(&strategy, record("Marry", 0)).0);
        assert_eq!(*seen.lock().unwrap(), vec!["Ben", "Ben"]);
    }

    #[test]
    fn test_derived_success_from_failure() {
        let strategy = echo()
            .failure(|r: &String| !r.contains("Ben"))
            .into_strategy()
            .unwrap();
        assert!(run(&strategy, record("Ben", 0)).0);
        assert!(!run(&strategy, record("John", 0)).0);
    }

    #[test]
    fn test_derived_success_respects_target_errors() {
        let strategy = echo()
            .failure(|_| false)
            .target_error(|r: &String| r.contains("John"))
            .into_strategy()
            .unwrap();
        assert!(run(&strategy, record("Ben", 0)).0);
        assert!(!run(&strategy, record("John", 0)).0);
    }

    #[test]
    fn test_conservative_fallback_never_succeeds() {
        let checked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checked);
        let strategy = echo()
            .failure(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .success_fallback(SuccessFallback::Conservative)
            .into_strategy()
            .unwrap();
        assert!(!run(&strategy, record("Ben", 0)).0);
        assert_eq!(checked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_record_transformed_once_across_retries() {
        let transforms = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let (t, r) = (Arc::clone(&transforms), Arc::clone(&requests));

        let strategy = Behavior::<String, String>::new(move |_, record: &Record, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(record.clone()).to_string())
        })
        .record_transformer(move |mut record| {
            t.fetch_add(1, Ordering::SeqCst);
            let password = record["password"].as_i64().unwrap_or_default();
            record.insert("password".into(), json!(password * 10));
            record
        })
        .success(|r: &String| r.contains("\"password\":10"))
        .client_error(|_| true)
        .max_retries(3)
        .into_strategy()
        .unwrap();

        let (success, attempt) = run(&strategy, record("Ben", 1));
        assert!(success);
        assert_eq!(requests.load(Ordering::SeqCst), 4);
        assert_eq!(transforms.load(Ordering::SeqCst), 1);
        assert_eq!(attempt.record()["password"], json!(10));
        assert_eq!(attempt.retries(), 3);
    }

    #[test]
    fn test_hooks_and_closers() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (before, after, closed) = (Arc::clone(&events), Arc::clone(&events), Arc::clone(&events));
        let strategy = echo()
            .success(|_| true)
            .before_connect(move |_, response| {
                before.lock().unwrap().push(format!("before:{}", response.is_some()));
            })
            .after_attempt(move |_, response| {
                after.lock().unwrap().push(format!("after:{}", response.is_some()));
            })
            .response_closer(move |_| closed.lock().unwrap().push("close".into()))
            .into_strategy()
            .unwrap();

        assert!(run(&strategy, record("Ben", 0)).0);
        assert_eq!(*events.lock().unwrap(), vec!["before:false", "after:true", "close"]);
    }

    #[test]
    fn test_session_value_is_shared_and_factory_is_invoked() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let closed = Arc::new(AtomicUsize::new(0));
        let closes = Arc::clone(&closed);

        let connect = |_: &String, _: &Record, session: Option<&usize>| -> anyhow::Result<String> {
            Ok(session.copied().unwrap_or(0).to_string())
        };

        let shared: Strategy<String, String, usize> = Behavior::new(connect)
            .session_value(7)
            .success(|r: &String| r == "7")
            .into_strategy()
            .unwrap();
        let a = shared.create_session().unwrap().unwrap();
        let b = shared.create_session().unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let fresh: Strategy<String, String, usize> = Behavior::new(connect)
            .session_factory(move || Ok(counter.fetch_add(1, Ordering::SeqCst) + 100))
            .session_closer(move |_| {
                closes.fetch_add(1, Ordering::SeqCst);
            })
            .success(|r: &String| r == "100")
            .into_strategy()
            .unwrap();
        let mut attempt = Attempt::new(Arc::new(String::new()), record("Ben", 0), 0);
        assert!(drive(&fresh, &mut attempt, None));
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}

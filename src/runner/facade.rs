use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_json::Value;
use tokio::runtime::{Builder, Handle};

use super::multi::Run;
use super::settings::RunSettings;
use crate::behavior::{AsyncBehavior, AsyncStrategy, Behavior, Strategy};
use crate::engine::{AsyncAttack, Attack, Record, RunEngine, Table};
use crate::error::{Error, Result};

/// Worker budget of the thread and executor variants
pub const DEFAULT_THREAD_WORKERS: usize = 15;

/// Worker budget of the event-loop variant
pub const DEFAULT_ASYNC_WORKERS: usize = 400;

/// Execution model of a [`Runner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Basic,
    Thread,
    Executor,
    Async,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Basic => "basic",
            RunnerKind::Thread => "thread",
            RunnerKind::Executor => "executor",
            RunnerKind::Async => "async",
        }
    }

    fn default_workers(&self) -> Option<usize> {
        match self {
            RunnerKind::Basic => None,
            RunnerKind::Thread | RunnerKind::Executor => Some(DEFAULT_THREAD_WORKERS),
            RunnerKind::Async => Some(DEFAULT_ASYNC_WORKERS),
        }
    }
}

enum Mode<T, R, S> {
    Blocking(Strategy<T, R, S>),
    Pooled {
        strategy: Strategy<T, R, S>,
        executor: Mutex<Option<Arc<ThreadPool>>>,
    },
    Cooperative {
        strategy: AsyncStrategy<T, R, S>,
        event_loop: Mutex<Option<Handle>>,
    },
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn with_fallback<T, R, S>(
    behavior: Behavior<T, R, S>,
    settings: &RunSettings,
) -> Behavior<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    match settings.success_fallback {
        Some(fallback) => behavior.success_fallback(fallback),
        None => behavior,
    }
}

/// One run engine bound to one resolved strategy.
///
/// Every execution model exposes the same control and query surface; the
/// engine is owned by this runner alone.
pub struct Runner<T, R, S = ()> {
    kind: RunnerKind,
    engine: RunEngine<T, R, S>,
    mode: Mode<T, R, S>,
}

impl<T, R, S> Runner<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Runs attempts one after another on the calling thread
    pub fn basic(
        target: T,
        table: Table,
        behavior: Behavior<T, R, S>,
        settings: &RunSettings,
    ) -> Result<Self> {
        let strategy = Strategy::new(with_fallback(behavior, settings))?;
        Ok(Self::assemble(
            RunnerKind::Basic,
            target,
            table,
            settings,
            Mode::Blocking(strategy),
        ))
    }

    /// Runs attempts on a thread pool created for each run
    pub fn thread(
        target: T,
        table: Table,
        behavior: Behavior<T, R, S>,
        settings: &RunSettings,
    ) -> Result<Self> {
        let strategy = Strategy::new(with_fallback(behavior, settings))?;
        Ok(Self::assemble(
            RunnerKind::Thread,
            target,
            table,
            settings,
            Mode::Pooled {
                strategy,
                executor: Mutex::new(None),
            },
        ))
    }

    /// Runs attempts on a caller-owned thread pool
    pub fn executor(
        target: T,
        table: Table,
        behavior: Behavior<T, R, S>,
        settings: &RunSettings,
        executor: Arc<ThreadPool>,
    ) -> Result<Self> {
        let strategy = Strategy::new(with_fallback(behavior, settings))?;
        Ok(Self::assemble(
            RunnerKind::Executor,
            target,
            table,
            settings,
            Mode::Pooled {
                strategy,
                executor: Mutex::new(Some(executor)),
            },
        ))
    }

    /// Runs attempts as cooperative tasks on one event loop
    pub fn asynchronous(
        target: T,
        table: Table,
        behavior: AsyncBehavior<T, R, S>,
        settings: &RunSettings,
    ) -> Result<Self> {
        let behavior = match settings.success_fallback {
            Some(fallback) => behavior.success_fallback(fallback),
            None => behavior,
        };
        let strategy = AsyncStrategy::new(behavior)?;
        Ok(Self::assemble(
            RunnerKind::Async,
            target,
            table,
            settings,
            Mode::Cooperative {
                strategy,
                event_loop: Mutex::new(None),
            },
        ))
    }

    fn assemble(
        kind: RunnerKind,
        target: T,
        table: Table,
        settings: &RunSettings,
        mode: Mode<T, R, S>,
    ) -> Self {
        let engine = RunEngine::new(target, table, settings.optimize);
        if let Some(total) = settings.max_success_records {
            engine.set_max_success_records(total);
        }
        if let Some(total) = settings.max_multiple_primary_items {
            engine.set_max_multiple_primary_items(total);
        }
        if let Some(total) = settings.max_primary_success_records {
            engine.set_max_primary_success_records(total);
        }
        if let Some(total) = settings.max_success_primary_items {
            engine.set_max_success_primary_items(total);
        }
        engine.add_excluded_primary_items(settings.excluded_primary_items.iter().cloned());

        if let Some(default) = kind.default_workers() {
            let workers = settings.max_workers.unwrap_or(default);
            engine.set_max_workers(workers);
            engine.set_max_parallel_tasks(workers);
        }

        Self { kind, engine, mode }
    }

    pub fn kind(&self) -> RunnerKind {
        self.kind
    }

    /// Runs through the table, blocking the caller until the run ends.
    ///
    /// The event-loop variant drives [`Runner::astart`] on the loop set with
    /// [`Runner::set_event_loop`], or on a loop created for this call and shut
    /// down afterwards. This must not be called from inside a running loop.
    /// Panics raised during the run are not caught.
    pub fn start(&self) -> Result<()> {
        match &self.mode {
            Mode::Blocking(strategy) => {
                self.engine.run_blocking(strategy);
                Ok(())
            }
            Mode::Pooled { strategy, executor } => {
                let supplied = lock(executor).clone();
                match supplied {
                    Some(pool) => self.engine.run_pool(strategy, &pool),
                    None => {
                        let pool = ThreadPoolBuilder::new()
                            .num_threads(self.engine.parallelism())
                            .thread_name(|i| format!("broote-worker-{}", i))
                            .build()?;
                        self.engine.run_pool(strategy, &pool);
                    }
                }
                Ok(())
            }
            Mode::Cooperative { event_loop, .. } => {
                let supplied = lock(event_loop).clone();
                match supplied {
                    Some(handle) => handle.block_on(self.astart()),
                    None => {
                        let runtime = Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .map_err(Error::EventLoop)?;
                        runtime.block_on(self.astart())
                    }
                }
            }
        }
    }

    /// Awaitable form of [`Runner::start`] for the event-loop variant
    pub async fn astart(&self) -> Result<()> {
        match &self.mode {
            Mode::Cooperative { strategy, .. } => {
                self.engine.run_async(strategy).await;
                Ok(())
            }
            _ => Err(self.unsupported("astart")),
        }
    }

    /// Stops dispatching; successes recorded so far are kept
    pub fn stop(&self) {
        self.engine.stop();
    }

    fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            operation,
            model: self.kind.as_str(),
        }
    }

    /// Pool used by later runs of the thread and executor variants
    pub fn set_executor(&self, pool: Arc<ThreadPool>) -> Result<()> {
        match &self.mode {
            Mode::Pooled { executor, .. } => {
                *lock(executor) = Some(pool);
                Ok(())
            }
            _ => Err(self.unsupported("set_executor")),
        }
    }

    /// Event loop used by later runs of the event-loop variant
    pub fn set_event_loop(&self, handle: Handle) -> Result<()> {
        match &self.mode {
            Mode::Cooperative { event_loop, .. } => {
                *lock(event_loop) = Some(handle);
                Ok(())
            }
            _ => Err(self.unsupported("set_event_loop")),
        }
    }

    pub fn get_event_loop(&self) -> Option<Handle> {
        match &self.mode {
            Mode::Cooperative { event_loop, .. } => lock(event_loop).clone(),
            _ => None,
        }
    }

    pub fn get_success_records(&self) -> Vec<Record> {
        self.engine.get_success_records()
    }

    pub fn success_exists(&self) -> bool {
        !self.engine.get_success_records().is_empty()
    }

    pub fn get_runner_time(&self) -> Duration {
        self.engine.get_runner_time()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn started(&self) -> bool {
        self.engine.started()
    }

    pub fn completed(&self) -> bool {
        self.engine.completed()
    }

    pub fn get_table(&self) -> &Table {
        self.engine.get_table()
    }

    pub fn target(&self) -> &Arc<T> {
        self.engine.target()
    }

    pub fn is_primary_optimised(&self) -> bool {
        self.engine.is_primary_optimised()
    }

    /// Session shared by every attempt; attempts never close it
    pub fn set_session(&self, session: Arc<S>) {
        self.engine.set_session(session);
    }

    pub fn get_session(&self) -> Option<Arc<S>> {
        self.engine.get_session()
    }

    pub fn session_exists(&self) -> bool {
        self.engine.session_exists()
    }

    /// Resolves the configured session the way an attempt would.
    ///
    /// Awaitable producers are driven on the calling thread, so in the
    /// event-loop variant this must not be called from inside the loop; use
    /// [`Runner::acreate_session`] there.
    pub fn create_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        match &self.mode {
            Mode::Blocking(strategy) | Mode::Pooled { strategy, .. } => {
                Attack::create_session(strategy)
            }
            Mode::Cooperative { .. } => futures::executor::block_on(self.acreate_session()),
        }
    }

    pub async fn acreate_session(&self) -> anyhow::Result<Option<Arc<S>>> {
        match &self.mode {
            Mode::Blocking(strategy) | Mode::Pooled { strategy, .. } => {
                Attack::create_session(strategy)
            }
            Mode::Cooperative { strategy, .. } => AsyncAttack::create_session(strategy).await,
        }
    }

    pub fn add_excluded_primary_item(&self, item: impl Into<Value>) {
        self.engine.add_excluded_primary_item(item.into());
    }

    pub fn add_excluded_primary_items<I, V>(&self, items: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.engine
            .add_excluded_primary_items(items.into_iter().map(Into::into));
    }

    pub fn remove_excluded_primary_item(&self, item: &Value) {
        self.engine.remove_excluded_primary_item(item);
    }

    pub fn remove_excluded_primary_items<'a>(&self, items: impl IntoIterator<Item = &'a Value>) {
        self.engine.remove_excluded_primary_items(items);
    }

    pub fn get_excluded_primary_items(&self) -> Vec<Value> {
        self.engine.get_excluded_primary_items()
    }

    pub fn set_max_success_records(&self, total: usize) {
        self.engine.set_max_success_records(total);
    }

    pub fn set_max_success_primary_items(&self, total: usize) {
        self.engine.set_max_success_primary_items(total);
    }

    pub fn set_max_primary_success_records(&self, total: usize) {
        self.engine.set_max_primary_success_records(total);
    }

    pub fn set_max_multiple_primary_items(&self, total: usize) {
        self.engine.set_max_multiple_primary_items(total);
    }

    /// Sets both the worker and the parallel task budget
    pub fn set_max_workers(&self, total: usize) {
        self.engine.set_max_workers(total);
        self.engine.set_max_parallel_tasks(total);
    }

    pub fn get_max_workers(&self) -> Option<usize> {
        self.engine.get_max_workers()
    }

    pub fn get_max_parallel_tasks(&self) -> Option<usize> {
        self.engine.get_max_parallel_tasks()
    }
}

impl<T, R, S> Run for Runner<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    fn start(&self) -> Result<()> {
        Runner::start(self)
    }

    fn stop(&self) {
        Runner::stop(self);
    }

    fn get_success_records(&self) -> Vec<Record> {
        Runner::get_success_records(self)
    }

    fn cooperative(self: Arc<Self>) -> Option<BoxFuture<'static, Result<()>>> {
        match self.kind {
            RunnerKind::Async => Some(async move { self.astart().await }.boxed()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Callable;
    use crate::behavior::SuccessFallback;
    use crate::engine::Field;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table() -> Table {
        Table::new()
            .with_primary_field(Field::new("username", ["Ben", "John", "Marry"]))
            .with_field(Field::new("password", 0..10))
    }

    fn is_ben_one(record: &Record) -> bool {
        record["username"] == json!("Ben") && record["password"] == json!(1)
    }

    fn behavior() -> Behavior<(), bool> {
        Behavior::new(|_: &(), record: &Record, _: Option<&()>| -> anyhow::Result<bool> {
            Ok(is_ben_one(record))
        })
        .success(|hit: &bool| *hit)
    }

    fn async_behavior() -> AsyncBehavior<(), bool> {
        AsyncBehavior::new(Callable::awaitable(
            |(_, record, _): (Arc<()>, Record, Option<Arc<()>>)| async move {
                Ok::<_, anyhow::Error>(is_ben_one(&record))
            },
        ))
        .success(Callable::blocking(|hit: Arc<bool>| *hit))
    }

    fn assert_ben_one(records: &[Record]) {
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["username"], json!("Ben"));
        assert_eq!(records[0]["password"], json!(1));
    }

    #[test]
    fn test_every_model_finds_the_same_record() {
        let settings = RunSettings::default().with_max_workers(4);
        let runners = vec![
            Runner::basic((), table(), behavior(), &settings).unwrap(),
            Runner::thread((), table(), behavior(), &settings).unwrap(),
            Runner::asynchronous((), table(), async_behavior(), &settings).unwrap(),
        ];
        for runner in runners {
            assert!(!runner.success_exists());
            assert!(!runner.started());
            runner.start().unwrap();
            assert!(runner.success_exists());
            assert!(runner.started());
            assert!(runner.completed());
            assert!(!runner.is_running());
            assert_ben_one(&runner.get_success_records());
        }
    }

    #[test]
    fn test_construction_requires_outcome() {
        let bare = Behavior::new(|_: &(), _: &Record, _: Option<&()>| Ok(true));
        let result = Runner::basic((), table(), bare, &RunSettings::default());
        assert!(matches!(result, Err(Error::MissingOutcome)));
    }

    #[test]
    fn test_worker_defaults_per_model() {
        let settings = RunSettings::default();
        let basic = Runner::basic((), table(), behavior(), &settings).unwrap();
        assert_eq!(basic.get_max_workers(), None);

        let thread = Runner::thread((), table(), behavior(), &settings).unwrap();
        assert_eq!(thread.get_max_workers(), Some(DEFAULT_THREAD_WORKERS));
        assert_eq!(thread.get_max_parallel_tasks(), Some(DEFAULT_THREAD_WORKERS));

        let cooperative = Runner::asynchronous((), table(), async_behavior(), &settings).unwrap();
        assert_eq!(cooperative.get_max_workers(), Some(DEFAULT_ASYNC_WORKERS));
        assert_eq!(cooperative.get_max_parallel_tasks(), Some(DEFAULT_ASYNC_WORKERS));

        let custom = Runner::thread((), table(), behavior(), &settings.with_max_workers(3)).unwrap();
        assert_eq!(custom.get_max_parallel_tasks(), Some(3));
    }

    #[test]
    fn test_settings_are_forwarded() {
        let settings = RunSettings::default()
            .with_optimize(false)
            .with_excluded_primary_items(["Ben"]);
        let runner = Runner::basic((), table(), behavior(), &settings).unwrap();
        assert!(!runner.is_primary_optimised());
        assert_eq!(runner.get_excluded_primary_items(), vec![json!("Ben")]);

        runner.start().unwrap();
        assert!(!runner.success_exists());

        runner.remove_excluded_primary_item(&json!("Ben"));
        runner.start().unwrap();
        assert_ben_one(&runner.get_success_records());
    }

    #[test]
    fn test_executor_is_left_open() {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        );
        let runner = Runner::executor(
            (),
            table(),
            behavior(),
            &RunSettings::default(),
            Arc::clone(&pool),
        )
        .unwrap();
        runner.start().unwrap();
        assert_ben_one(&runner.get_success_records());
        assert_eq!(pool.install(|| 1 + 1), 2);
    }

    #[test]
    fn test_supplied_event_loop_is_reused() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let runner =
            Runner::asynchronous((), table(), async_behavior(), &RunSettings::default()).unwrap();
        assert!(runner.get_event_loop().is_none());
        runner.set_event_loop(runtime.handle().clone()).unwrap();
        assert!(runner.get_event_loop().is_some());

        runner.start().unwrap();
        assert_ben_one(&runner.get_success_records());
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }

    #[tokio::test]
    async fn test_astart_embeds_in_running_loop() {
        let runner =
            Runner::asynchronous((), table(), async_behavior(), &RunSettings::default()).unwrap();
        runner.astart().await.unwrap();
        assert_ben_one(&runner.get_success_records());

        let basic = Runner::basic((), table(), behavior(), &RunSettings::default()).unwrap();
        assert!(matches!(
            basic.astart().await,
            Err(Error::Unsupported { operation: "astart", .. })
        ));
    }

    #[test]
    fn test_model_specific_setters_are_rejected() {
        let basic = Runner::basic((), table(), behavior(), &RunSettings::default()).unwrap();
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().build().unwrap());
        assert!(basic.set_executor(pool).is_err());

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(basic.set_event_loop(runtime.handle().clone()).is_err());
    }

    #[test]
    fn test_create_session_per_model() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let blocking: Behavior<(), bool, String> =
            Behavior::new(|_: &(), _: &Record, _: Option<&String>| Ok(true))
                .success(|hit: &bool| *hit)
                .session_factory(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                });
        let runner = Runner::basic((), table(), blocking, &RunSettings::default()).unwrap();
        let session = runner.create_session().unwrap().unwrap();
        assert_eq!(session.as_str(), "fresh");
        assert_eq!(produced.load(Ordering::SeqCst), 1);

        let cooperative: AsyncBehavior<(), bool, String> = AsyncBehavior::new(Callable::blocking(
            |_: (Arc<()>, Record, Option<Arc<String>>)| Ok::<_, anyhow::Error>(true),
        ))
        .success(Callable::blocking(|hit: Arc<bool>| *hit))
        .session_factory(Callable::awaitable(|()| async {
            Ok::<_, anyhow::Error>("awaited".to_string())
        }));
        let runner =
            Runner::asynchronous((), table(), cooperative, &RunSettings::default()).unwrap();
        assert_eq!(runner.create_session().unwrap().unwrap().as_str(), "awaited");

        assert!(!runner.session_exists());
        runner.set_session(Arc::new("shared".to_string()));
        assert_eq!(runner.get_session().unwrap().as_str(), "shared");
    }

    #[test]
    fn test_configured_success_fallback_applies() {
        let failure_only = || {
            Behavior::new(|_: &(), record: &Record, _: Option<&()>| -> anyhow::Result<bool> {
                Ok(is_ben_one(record))
            })
            .failure(|hit: &bool| !*hit)
        };

        let derived = Runner::basic((), table(), failure_only(), &RunSettings::default()).unwrap();
        derived.start().unwrap();
        assert_ben_one(&derived.get_success_records());

        let settings = RunSettings::default().with_success_fallback(SuccessFallback::Conservative);
        let conservative = Runner::basic((), table(), failure_only(), &settings).unwrap();
        conservative.start().unwrap();
        assert!(!conservative.success_exists());
    }

    #[test]
    fn test_huge_table_starts_under_info_subscriber() {
        let mut huge = Table::new().with_primary_field(Field::new("username", ["Ben"]));
        for i in 0..5 {
            huge.add_field(Field::new(format!("word{}", i), 0..10_000));
        }
        let always =
            Behavior::new(|_: &(), _: &Record, _: Option<&()>| -> anyhow::Result<bool> { Ok(true) })
                .success(|hit: &bool| *hit);
        let settings = RunSettings::default().with_max_success_records(1);
        let runner = Runner::basic((), huge, always, &settings).unwrap();

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || runner.start()).unwrap();
        assert_eq!(runner.get_success_records().len(), 1);
        assert!(runner.completed());
    }

    #[test]
    fn test_supplied_current_thread_loop_is_reused() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let runner =
            Runner::asynchronous((), table(), async_behavior(), &RunSettings::default()).unwrap();
        runner.set_event_loop(runtime.handle().clone()).unwrap();

        runner.start().unwrap();
        assert_ben_one(&runner.get_success_records());
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }

    #[test]
    fn test_stop_before_start_does_not_block_run() {
        let runner = Runner::basic((), table(), behavior(), &RunSettings::default()).unwrap();
        runner.stop();
        runner.start().unwrap();
        assert!(runner.completed());
        assert_ben_one(&runner.get_success_records());
    }
}

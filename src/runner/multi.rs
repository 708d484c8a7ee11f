use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{self, BoxFuture, FutureExt};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::runtime::{Builder, Handle};

use crate::engine::Record;
use crate::error::{Error, Result};

/// Control surface shared by runners and multi-runners
pub trait Run: Send + Sync {
    /// Runs to completion, blocking the caller
    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn get_success_records(&self) -> Vec<Record>;

    fn success_exists(&self) -> bool {
        !self.get_success_records().is_empty()
    }

    /// Native awaitable run, for runners that can share an event loop.
    ///
    /// `None` means the runner only runs through the blocking
    /// [`Run::start`].
    fn cooperative(self: Arc<Self>) -> Option<BoxFuture<'static, Result<()>>> {
        None
    }
}

/// How a [`MultiRunner`] schedules its runners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// One after another; the first failure aborts the rest
    Sequential,
    /// One pool thread per runner; every runner finishes before a failure is surfaced
    Thread,
    /// One event loop; blocking runners are offloaded to worker threads
    Async,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Sequential => "sequential",
            Schedule::Thread => "thread",
            Schedule::Async => "async",
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs an ordered set of runners under one schedule
pub struct MultiRunner {
    runners: Vec<Arc<dyn Run>>,
    schedule: Schedule,
    executor: Mutex<Option<Arc<ThreadPool>>>,
    event_loop: Mutex<Option<Handle>>,
}

impl MultiRunner {
    pub fn new(schedule: Schedule, runners: impl IntoIterator<Item = Arc<dyn Run>>) -> Self {
        Self {
            runners: runners.into_iter().collect(),
            schedule,
            executor: Mutex::new(None),
            event_loop: Mutex::new(None),
        }
    }

    pub fn sequential(runners: impl IntoIterator<Item = Arc<dyn Run>>) -> Self {
        Self::new(Schedule::Sequential, runners)
    }

    pub fn thread(runners: impl IntoIterator<Item = Arc<dyn Run>>) -> Self {
        Self::new(Schedule::Thread, runners)
    }

    pub fn asynchronous(runners: impl IntoIterator<Item = Arc<dyn Run>>) -> Self {
        Self::new(Schedule::Async, runners)
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn runners(&self) -> &[Arc<dyn Run>] {
        &self.runners
    }

    fn unsupported(&self, operation: &'static str) -> Error {
        Error::Unsupported {
            operation,
            model: self.schedule.as_str(),
        }
    }

    /// Caller-owned pool for the thread schedule; it is never shut down here
    pub fn set_executor(&self, pool: Arc<ThreadPool>) -> Result<()> {
        match self.schedule {
            Schedule::Thread => {
                *lock(&self.executor) = Some(pool);
                Ok(())
            }
            _ => Err(self.unsupported("set_executor")),
        }
    }

    /// Caller-owned event loop for the async schedule; it is never shut down here.
    ///
    /// Any runtime flavor is accepted. A current-thread runtime only drives
    /// tokio IO and timers while some thread is inside its `Runtime::block_on`.
    pub fn set_event_loop(&self, handle: Handle) -> Result<()> {
        match self.schedule {
            Schedule::Async => {
                *lock(&self.event_loop) = Some(handle);
                Ok(())
            }
            _ => Err(self.unsupported("set_event_loop")),
        }
    }

    /// Runs every runner, blocking the caller
    pub fn start(&self) -> Result<()> {
        tracing::info!(
            runners = self.runners.len(),
            schedule = self.schedule.as_str(),
            "multi-run started"
        );
        let result = match self.schedule {
            Schedule::Sequential => self.start_sequential(),
            Schedule::Thread => self.start_threaded(),
            Schedule::Async => {
                let supplied = lock(&self.event_loop).clone();
                match supplied {
                    Some(handle) => handle.block_on(self.join_cooperative()),
                    None => {
                        let runtime = Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .map_err(Error::EventLoop)?;
                        runtime.block_on(self.join_cooperative())
                    }
                }
            }
        };
        tracing::info!(ok = result.is_ok(), "multi-run finished");
        result
    }

    /// Awaitable form of [`MultiRunner::start`] for the async schedule
    pub async fn astart(&self) -> Result<()> {
        match self.schedule {
            Schedule::Async => self.join_cooperative().await,
            _ => Err(self.unsupported("astart")),
        }
    }

    fn start_sequential(&self) -> Result<()> {
        for runner in &self.runners {
            runner.start()?;
        }
        Ok(())
    }

    fn start_threaded(&self) -> Result<()> {
        let supplied = lock(&self.executor).clone();
        let owned;
        let pool: &ThreadPool = match &supplied {
            Some(pool) => pool,
            None => {
                owned = ThreadPoolBuilder::new()
                    .num_threads(self.runners.len().max(1))
                    .thread_name(|i| format!("broote-runner-{}", i))
                    .build()?;
                &owned
            }
        };

        let mut results: Vec<Option<Result<()>>> = self.runners.iter().map(|_| None).collect();
        pool.scope(|scope| {
            for (runner, slot) in self.runners.iter().zip(results.iter_mut()) {
                scope.spawn(move |_| *slot = Some(runner.start()));
            }
        });
        // First failure in runner order, after every runner has finished.
        results.into_iter().flatten().collect()
    }

    /// Drives every runner on the current event loop and joins them.
    ///
    /// Native runs are polled by the future awaiting this call; blocking
    /// runners are offloaded to worker threads. The first failure returns at
    /// once: native runs still pending are dropped, offloaded ones keep
    /// running detached.
    async fn join_cooperative(&self) -> Result<()> {
        let units: Vec<BoxFuture<'static, Result<()>>> = self
            .runners
            .iter()
            .map(|runner| match Arc::clone(runner).cooperative() {
                Some(native) => native,
                None => {
                    let runner = Arc::clone(runner);
                    tokio::task::spawn_blocking(move || runner.start())
                        .map(|joined| match joined {
                            Ok(result) => result,
                            Err(err) if err.is_panic() => {
                                std::panic::resume_unwind(err.into_panic())
                            }
                            Err(_) => Err(Error::Interrupted),
                        })
                        .boxed()
                }
            })
            .collect();

        future::try_join_all(units).await?;
        Ok(())
    }

    /// Success records of every runner, concatenated in runner order
    pub fn get_success_records(&self) -> Vec<Record> {
        self.runners
            .iter()
            .flat_map(|runner| runner.get_success_records())
            .collect()
    }

    pub fn success_exists(&self) -> bool {
        self.runners.iter().any(|runner| runner.success_exists())
    }

    pub fn stop(&self) {
        for runner in &self.runners {
            runner.stop();
        }
    }
}

impl Run for MultiRunner {
    fn start(&self) -> Result<()> {
        MultiRunner::start(self)
    }

    fn stop(&self) {
        MultiRunner::stop(self);
    }

    fn get_success_records(&self) -> Vec<Record> {
        MultiRunner::get_success_records(self)
    }

    fn success_exists(&self) -> bool {
        MultiRunner::success_exists(self)
    }

    fn cooperative(self: Arc<Self>) -> Option<BoxFuture<'static, Result<()>>> {
        match self.schedule {
            Schedule::Async => Some(async move { self.join_cooperative().await }.boxed()),
            _ => None,
        }
    }
}

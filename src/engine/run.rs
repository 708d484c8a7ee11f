use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon::ThreadPool;
use serde_json::Value;

use super::attack::{drive, drive_async, AsyncAttack, Attack, Attempt};
use super::table::{Record, Table};

/// Dispatch limits applied before every record
#[derive(Debug, Clone, Default)]
struct Limits {
    max_success_records: Option<usize>,
    max_success_primary_items: Option<usize>,
    max_primary_success_records: Option<usize>,
    max_multiple_primary_items: Option<usize>,
    max_parallel_tasks: Option<usize>,
    max_workers: Option<usize>,
    excluded_primary_items: Vec<Value>,
}

#[derive(Debug, Default)]
struct Progress {
    success_records: Vec<Record>,
    /// Successes per primary value, keyed by its JSON text
    primary_successes: HashMap<String, usize>,
    started_at: Option<Instant>,
    elapsed: Duration,
}

/// Drives attempts over every record of a table.
///
/// All state sits behind interior mutability so a run can be observed and
/// stopped from other threads while it is in progress.
pub struct RunEngine<T, R, S> {
    target: Arc<T>,
    table: Table,
    optimize: bool,
    limits: Mutex<Limits>,
    progress: Mutex<Progress>,
    session: Mutex<Option<Arc<S>>>,
    running: AtomicBool,
    started: AtomicBool,
    completed: AtomicBool,
    stop_requested: AtomicBool,
    exhausted: AtomicBool,
    _response: PhantomData<fn() -> R>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    // State stays consistent under poisoning: every update is a single assignment or push.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ends the run when dropped, so a panicking or cancelled run still resets
/// the status flags
struct RunGuard<'a, T, R, S> {
    engine: &'a RunEngine<T, R, S>,
    ended: bool,
}

impl<T, R, S> RunGuard<'_, T, R, S> {
    /// The table was gone through, possibly cut short by `stop()` or limits
    fn end(mut self) {
        self.ended = true;
    }
}

impl<T, R, S> Drop for RunGuard<'_, T, R, S> {
    fn drop(&mut self) {
        self.engine.finish(self.ended);
    }
}

impl<T, R, S> RunEngine<T, R, S> {
    fn finish(&self, ended: bool) {
        let (successes, elapsed) = {
            let mut progress = lock(&self.progress);
            if let Some(started_at) = progress.started_at {
                progress.elapsed = started_at.elapsed();
            }
            (progress.success_records.len(), progress.elapsed)
        };
        let stopped = self.stop_requested.load(Ordering::SeqCst);
        self.completed.store(ended && !stopped, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if ended {
            tracing::info!(
                successes,
                stopped,
                elapsed_ms = elapsed.as_millis() as u64,
                "run finished"
            );
        } else {
            tracing::warn!(successes, "run aborted");
        }
    }
}

impl<T, R, S> RunEngine<T, R, S>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(target: T, table: Table, optimize: bool) -> Self {
        Self {
            target: Arc::new(target),
            table,
            optimize,
            limits: Mutex::new(Limits::default()),
            progress: Mutex::new(Progress::default()),
            session: Mutex::new(None),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            _response: PhantomData,
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    pub fn get_table(&self) -> &Table {
        &self.table
    }

    /// Records are dispatched per primary group
    pub fn is_primary_optimised(&self) -> bool {
        self.optimize && self.table.primary_field().is_some()
    }

    pub fn set_max_success_records(&self, total: usize) {
        lock(&self.limits).max_success_records = Some(total);
    }

    pub fn set_max_success_primary_items(&self, total: usize) {
        lock(&self.limits).max_success_primary_items = Some(total);
    }

    pub fn set_max_primary_success_records(&self, total: usize) {
        lock(&self.limits).max_primary_success_records = Some(total);
    }

    pub fn set_max_multiple_primary_items(&self, total: usize) {
        lock(&self.limits).max_multiple_primary_items = Some(total);
    }

    pub fn set_max_parallel_tasks(&self, total: usize) {
        lock(&self.limits).max_parallel_tasks = Some(total);
    }

    pub fn set_max_workers(&self, total: usize) {
        lock(&self.limits).max_workers = Some(total);
    }

    pub fn get_max_workers(&self) -> Option<usize> {
        lock(&self.limits).max_workers
    }

    pub fn get_max_parallel_tasks(&self) -> Option<usize> {
        lock(&self.limits).max_parallel_tasks
    }

    pub fn add_excluded_primary_item(&self, item: Value) {
        let mut limits = lock(&self.limits);
        if !limits.excluded_primary_items.contains(&item) {
            limits.excluded_primary_items.push(item);
        }
    }

    pub fn add_excluded_primary_items(&self, items: impl IntoIterator<Item = Value>) {
        for item in items {
            self.add_excluded_primary_item(item);
        }
    }

    pub fn remove_excluded_primary_item(&self, item: &Value) {
        lock(&self.limits).excluded_primary_items.retain(|i| i != item);
    }

    pub fn remove_excluded_primary_items<'a>(&self, items: impl IntoIterator<Item = &'a Value>) {
        for item in items {
            self.remove_excluded_primary_item(item);
        }
    }

    pub fn get_excluded_primary_items(&self) -> Vec<Value> {
        lock(&self.limits).excluded_primary_items.clone()
    }

    pub fn set_session(&self, session: Arc<S>) {
        *lock(&self.session) = Some(session);
    }

    pub fn get_session(&self) -> Option<Arc<S>> {
        lock(&self.session).clone()
    }

    pub fn session_exists(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn get_success_records(&self) -> Vec<Record> {
        lock(&self.progress).success_records.clone()
    }

    /// Elapsed time of the current or latest run
    pub fn get_runner_time(&self) -> Duration {
        let progress = lock(&self.progress);
        match progress.started_at {
            Some(started_at) if self.is_running() => started_at.elapsed(),
            _ => progress.elapsed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Latest run went through the table without being stopped
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stops dispatching records. Attempts in flight finish normally.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Number of units allowed to run at the same time
    pub fn parallelism(&self) -> usize {
        let limits = lock(&self.limits);
        let mut budget = [limits.max_workers, limits.max_parallel_tasks]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(1);
        if self.is_primary_optimised() {
            if let Some(groups) = limits.max_multiple_primary_items {
                budget = budget.min(groups);
            }
        }
        budget.max(1)
    }

    fn is_halted(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || self.exhausted.load(Ordering::SeqCst)
    }

    fn begin(&self) -> RunGuard<'_, T, R, S> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        self.completed.store(false, Ordering::SeqCst);
        {
            let mut progress = lock(&self.progress);
            progress.success_records.clear();
            progress.primary_successes.clear();
            progress.elapsed = Duration::ZERO;
            progress.started_at = Some(Instant::now());
        }
        self.started.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            records = self.table.len(),
            optimised = self.is_primary_optimised(),
            parallelism = self.parallelism(),
            "run started"
        );
        RunGuard {
            engine: self,
            ended: false,
        }
    }

    /// Whether `record` may still be attempted under the current limits
    fn should_dispatch(&self, record: &Record) -> bool {
        if self.is_halted() {
            return false;
        }
        let Some(primary) = self.table.primary_value(record) else {
            return true;
        };
        let limits = lock(&self.limits);
        if limits.excluded_primary_items.contains(primary) {
            return false;
        }
        let progress = lock(&self.progress);
        let successes = progress
            .primary_successes
            .get(&primary.to_string())
            .copied()
            .unwrap_or(0);
        if limits
            .max_primary_success_records
            .is_some_and(|max| successes >= max)
        {
            return false;
        }
        if successes == 0
            && limits
                .max_success_primary_items
                .is_some_and(|max| progress.primary_successes.len() >= max)
        {
            return false;
        }
        true
    }

    /// Records a success unless a limit was reached while the attempt ran
    fn register(&self, record: Record, success: bool) {
        if !success {
            return;
        }
        let limits = lock(&self.limits);
        let max_success_records = limits.max_success_records;
        let mut progress = lock(&self.progress);
        if max_success_records.is_some_and(|max| progress.success_records.len() >= max) {
            return;
        }
        if let Some(primary) = self.table.primary_value(&record) {
            let key = primary.to_string();
            let successes = progress.primary_successes.get(&key).copied().unwrap_or(0);
            if limits
                .max_primary_success_records
                .is_some_and(|max| successes >= max)
            {
                tracing::debug!(primary = %key, "primary success cap reached");
                return;
            }
            if successes == 0
                && limits
                    .max_success_primary_items
                    .is_some_and(|max| progress.primary_successes.len() >= max)
            {
                tracing::debug!(primary = %key, "max primaries with success reached");
                return;
            }
            *progress.primary_successes.entry(key).or_insert(0) += 1;
        }
        drop(limits);
        let shown = Value::Object(record.clone());
        tracing::debug!(record = %shown, "success record");
        progress.success_records.push(record);
        if max_success_records.is_some_and(|max| progress.success_records.len() >= max) {
            tracing::debug!("max success records reached");
            self.exhausted.store(true, Ordering::SeqCst);
        }
    }

    fn attempt<A>(&self, attack: &A, record: Record)
    where
        A: Attack<T, R, S> + ?Sized,
    {
        if !self.should_dispatch(&record) {
            return;
        }
        let mut attempt = Attempt::new(Arc::clone(&self.target), record.clone(), attack.max_retries());
        let success = drive(attack, &mut attempt, self.get_session());
        self.register(record, success);
    }

    async fn attempt_async<A>(&self, attack: &A, record: Record)
    where
        A: AsyncAttack<T, R, S> + ?Sized,
    {
        if !self.should_dispatch(&record) {
            return;
        }
        let mut attempt = Attempt::new(Arc::clone(&self.target), record.clone(), attack.max_retries());
        let success = drive_async(attack, &mut attempt, self.get_session()).await;
        self.register(record, success);
    }

    fn attempt_group<A>(&self, attack: &A, group: Vec<Record>)
    where
        A: Attack<T, R, S> + ?Sized,
    {
        for record in group {
            if self.is_halted() {
                break;
            }
            self.attempt(attack, record);
        }
    }

    /// Runs every record on the calling thread
    pub fn run_blocking<A>(&self, attack: &A)
    where
        A: Attack<T, R, S> + ?Sized,
    {
        let guard = self.begin();
        for record in self.table.records() {
            if self.is_halted() {
                break;
            }
            self.attempt(attack, record);
        }
        guard.end();
    }

    /// Next unit of work, or `None` once the run is halted or drained
    fn next_unit<I: Iterator>(&self, units: &Mutex<I>) -> Option<I::Item> {
        if self.is_halted() {
            return None;
        }
        lock(units).next()
    }

    /// Runs records on the threads of `pool`.
    ///
    /// At most [`RunEngine::parallelism`] units run at the same time, however
    /// large the pool is.
    pub fn run_pool<A>(&self, attack: &A, pool: &ThreadPool)
    where
        A: Attack<T, R, S> + ?Sized,
    {
        let guard = self.begin();
        let workers = self.parallelism();
        if self.is_primary_optimised() {
            let groups = Mutex::new(self.table.records_grouped());
            pool.install(|| {
                (0..workers).into_par_iter().for_each(|_| {
                    while let Some((_, group)) = self.next_unit(&groups) {
                        self.attempt_group(attack, group);
                    }
                })
            });
        } else {
            let records = Mutex::new(self.table.records());
            pool.install(|| {
                (0..workers).into_par_iter().for_each(|_| {
                    while let Some(record) = self.next_unit(&records) {
                        self.attempt(attack, record);
                    }
                })
            });
        }
        guard.end();
    }

    /// Runs records as cooperative tasks on the current event loop
    pub async fn run_async<A>(&self, attack: &A)
    where
        A: AsyncAttack<T, R, S> + ?Sized,
    {
        let guard = self.begin();
        let limit = self.parallelism();
        if self.is_primary_optimised() {
            stream::iter(self.table.records_grouped())
                .take_while(|_| futures::future::ready(!self.is_halted()))
                .for_each_concurrent(limit, |(_, group)| async move {
                    for record in group {
                        if self.is_halted() {
                            break;
                        }
                        self.attempt_async(attack, record).await;
                    }
                })
                .await;
        } else {
            stream::iter(self.table.records())
                .take_while(|_| futures::future::ready(!self.is_halted()))
                .for_each_concurrent(limit, |record| self.attempt_async(attack, record))
                .await;
        }
        guard.end();
    }
}

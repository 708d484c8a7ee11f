//! Runner facades over the run engine, and multi-run orchestration.

mod facade;
mod multi;
mod settings;

pub use facade::{Runner, RunnerKind, DEFAULT_ASYNC_WORKERS, DEFAULT_THREAD_WORKERS};
pub use multi::{MultiRunner, Run, Schedule};
pub use settings::RunSettings;

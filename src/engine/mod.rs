//! Attempt lifecycle and table traversal.

mod attack;
pub mod heuristics;
mod run;
mod table;

pub use attack::{drive, drive_async, AsyncAttack, Attack, Attempt};
pub use run::RunEngine;
pub use table::{Field, Record, Table};

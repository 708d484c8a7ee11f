//! Brute-force runners built from plain callbacks.
//!
//! A [`Behavior`] (or [`AsyncBehavior`]) describes how to connect to a target
//! and how to read the response. A [`Runner`] binds it to a run over a
//! [`Table`] of candidate records, in a blocking, thread-pool or event-loop
//! model, and a [`MultiRunner`] runs several of them together.

pub mod adapter;
pub mod behavior;
pub mod engine;
pub mod error;
pub mod runner;

pub use behavior::{AsyncBehavior, Behavior, Check, SuccessFallback};
pub use engine::{Field, Record, Table};
pub use error::{Error, Result};
pub use runner::{MultiRunner, Run, RunSettings, Runner, RunnerKind, Schedule};

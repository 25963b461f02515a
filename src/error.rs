//! Error types for the subset of failures a caller might want to observe.
//!
//! Fatal conditions (§7 "Invariant violation", "Unimplemented policy
//! branch") are not represented here: they are detected with `assert!`/
//! `panic!` at the point of violation, matching the original's `ASSERT`
//! macro, which logs and calls `exit(1)`. This enum only covers the two
//! recoverable kinds from the same table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("capacity pressure: {resource} requested {requested}, soft limit {limit}")]
    CapacityPressure {
        resource: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("app {app_id} model {model_id} missed its deadline at cycle {now}")]
    DeadlineMissed {
        app_id: i32,
        model_id: u64,
        now: u64,
    },
}

pub type SimResult<T> = Result<T, SimError>;

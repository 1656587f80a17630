/// Item reader, processor and writer contracts
pub mod item;

/// Per-chunk transaction handle
pub mod transaction;

pub mod context;

pub mod skip;

/// Before/after hooks for steps and jobs
pub mod listener;

pub mod step;

pub mod job;

/// Launch guard, job repository and job launcher
pub mod launcher;

/// Generates a random eight character name.
fn build_name() -> String {
    let mut name = uuid::Uuid::new_v4().simple().to_string();
    name.truncate(8);
    name
}

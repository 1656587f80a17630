//! Lifecycle hooks, one capability per trait.
//!
//! A component implements only the hooks it cares about. Steps and jobs call every
//! registered before-hook once before doing any work and every after-hook once when
//! they finish, whatever the outcome.

use super::{job::JobExecution, step::StepExecution};

pub trait BeforeStep {
    fn before_step(&self, step_execution: &StepExecution);
}

pub trait AfterStep {
    fn after_step(&self, step_execution: &StepExecution);
}

pub trait BeforeJob {
    fn before_job(&self, job_execution: &JobExecution);
}

pub trait AfterJob {
    fn after_job(&self, job_execution: &JobExecution);
}

use chrono::{DateTime, Utc};
use log::{error, info};
use uuid::Uuid;

use crate::error::BatchError;

use super::{
    build_name,
    context::ExecutionContext,
    launcher::JobParameters,
    listener::{AfterJob, BeforeJob},
    step::{BatchStatus, Step, StepExecution},
};

/// Represents a job that can be executed.
///
/// A job is an ordered sequence of steps executed one after the other. Execution stops at
/// the first failed step.
pub trait Job {
    fn get_name(&self) -> &str;

    /// Runs the job, recording every step execution and the final status in `execution`.
    fn execute(&self, execution: &mut JobExecution);
}

/// Execution record of one job run.
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Executions of the steps that ran, in order
    pub step_executions: Vec<StepExecution>,
    /// State shared by every step of this run
    pub context: ExecutionContext,
    /// Error that failed the job, if any
    pub failure: Option<String>,
    /// Step executions of the failed run this one restarts
    previous_step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn new(job_name: &str, parameters: JobParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            parameters,
            status: BatchStatus::Starting,
            start_time: None,
            end_time: None,
            step_executions: Vec::new(),
            context: ExecutionContext::new(),
            failure: None,
            previous_step_executions: Vec::new(),
        }
    }

    /// Creates an execution restarting `previous`: its job context is carried over and its
    /// step executions decide which steps are skipped or resumed.
    pub fn restart_of(previous: &JobExecution) -> Self {
        let mut execution = Self::new(&previous.job_name, previous.parameters.clone());
        execution.context = previous.context.clone();
        execution.previous_step_executions = previous.all_step_executions();
        execution
    }

    pub fn is_restart(&self) -> bool {
        !self.previous_step_executions.is_empty()
    }

    /// Latest known execution of `step_name`, from this run or the run it restarts.
    pub fn last_step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .chain(self.previous_step_executions.iter().rev())
            .find(|execution| execution.name == step_name)
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .find(|execution| execution.name == step_name)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Step executions of this run merged with those of the run it restarts, the most
    /// recent one per step winning.
    fn all_step_executions(&self) -> Vec<StepExecution> {
        let mut merged: Vec<StepExecution> = self.previous_step_executions.clone();
        for execution in &self.step_executions {
            merged.retain(|previous| previous.name != execution.name);
            merged.push(execution.clone());
        }
        merged
    }
}

/// A job made of an ordered list of steps.
///
/// # Lifecycle
///
/// A job instance is created through the `JobBuilder` and executed by a
/// [`JobLauncher`](super::launcher::JobLauncher). The steps are executed in the order
/// they were added.
pub struct JobInstance<'a> {
    /// Unique identifier for this job instance
    id: Uuid,
    /// Human-readable name for the job
    name: String,
    /// Collection of steps that make up this job, in execution order
    steps: Vec<&'a dyn Step>,
    before_listeners: Vec<&'a dyn BeforeJob>,
    after_listeners: Vec<&'a dyn AfterJob>,
}

impl Job for JobInstance<'_> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, execution: &mut JobExecution) {
        execution.status = BatchStatus::Started;
        execution.start_time = Some(Utc::now());

        info!(
            "Start of job: {}, id: {}, execution: {}",
            self.name, self.id, execution.id
        );

        for listener in &self.before_listeners {
            listener.before_job(execution);
        }

        let mut status = BatchStatus::Completed;

        for step in &self.steps {
            let previous = execution.last_step_execution(step.get_name()).cloned();

            let mut step_execution = match previous {
                Some(previous)
                    if previous.status == BatchStatus::Completed
                        && !step.allow_start_if_complete() =>
                {
                    info!(
                        "Step {} already completed, skipping it on restart",
                        step.get_name()
                    );
                    continue;
                }
                // a completed step allowed to run again starts over
                Some(previous) if previous.status == BatchStatus::Completed => {
                    StepExecution::new(step.get_name())
                }
                Some(previous) => StepExecution::with_context(step.get_name(), previous.context),
                None => StepExecution::new(step.get_name()),
            };

            let result = step.execute(&mut step_execution, &mut execution.context);
            execution.step_executions.push(step_execution);

            if let Err(error) = result {
                error!("Job {} aborted: {}", self.name, error);
                execution.failure = Some(error.to_string());
                status = BatchStatus::Failed;
                break;
            }
        }

        execution.status = status;
        execution.end_time = Some(Utc::now());

        for listener in &self.after_listeners {
            listener.after_job(execution);
        }

        info!(
            "End of job: {}, id: {}, status: {:?}",
            self.name, self.id, execution.status
        );
    }
}

/// Builder for creating a job instance.
///
/// ```
/// # use user_batch::core::job::JobBuilder;
/// # use user_batch::core::step::Step;
/// # fn wire<'a>(import: &'a dyn Step, export: &'a dyn Step) {
/// let job = JobBuilder::new()
///     .name("fullJob")
///     .start(import)
///     .next(export)
///     .build()
///     .unwrap();
/// # }
/// ```
#[derive(Default)]
pub struct JobBuilder<'a> {
    /// Optional name for the job (generated randomly if not specified)
    name: Option<String>,
    /// Collection of steps to be executed, in order
    steps: Vec<&'a dyn Step>,
    before_listeners: Vec<&'a dyn BeforeJob>,
    after_listeners: Vec<&'a dyn AfterJob>,
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> JobBuilder<'a> {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the first step of the job.
    ///
    /// Identical to `next()`; reads better for the initial step.
    pub fn start(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    /// Adds a step to the job. Steps are executed in the order they are added.
    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(step);
        self
    }

    pub fn before_job(mut self, listener: &'a dyn BeforeJob) -> JobBuilder<'a> {
        self.before_listeners.push(listener);
        self
    }

    pub fn after_job(mut self, listener: &'a dyn AfterJob) -> JobBuilder<'a> {
        self.after_listeners.push(listener);
        self
    }

    /// Registers a listener implementing both job hooks.
    pub fn listener<L: BeforeJob + AfterJob>(self, listener: &'a L) -> JobBuilder<'a> {
        self.before_job(listener).after_job(listener)
    }

    /// # Errors
    ///
    /// `BatchError::Configuration` when the job has no step or two steps share a name.
    pub fn build(self) -> Result<JobInstance<'a>, BatchError> {
        let name = self.name.unwrap_or_else(build_name);

        if self.steps.is_empty() {
            return Err(BatchError::Configuration(format!(
                "job {name}: at least one step is required"
            )));
        }

        for (index, step) in self.steps.iter().enumerate() {
            if self.steps[..index]
                .iter()
                .any(|other| other.get_name() == step.get_name())
            {
                return Err(BatchError::Configuration(format!(
                    "job {name}: duplicate step name {}",
                    step.get_name()
                )));
            }
        }

        Ok(JobInstance {
            id: Uuid::new_v4(),
            name,
            steps: self.steps,
            before_listeners: self.before_listeners,
            after_listeners: self.after_listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    /// Step that succeeds or fails on demand and counts its executions.
    struct FakeStep {
        name: &'static str,
        fail: Cell<bool>,
        runs: Cell<usize>,
        seen_context: RefCell<Option<ExecutionContext>>,
        rerun: bool,
    }

    impl FakeStep {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                fail: Cell::new(fail),
                runs: Cell::new(0),
                seen_context: RefCell::new(None),
                rerun: false,
            }
        }

        fn rerunnable(name: &'static str) -> Self {
            Self {
                rerun: true,
                ..Self::new(name, false)
            }
        }
    }

    impl Step for FakeStep {
        fn get_name(&self) -> &str {
            self.name
        }

        fn execute(
            &self,
            step_execution: &mut StepExecution,
            job_context: &mut ExecutionContext,
        ) -> Result<(), BatchError> {
            self.runs.set(self.runs.get() + 1);
            *self.seen_context.borrow_mut() = Some(step_execution.context.clone());
            job_context.put(format!("{}.ran", self.name), true);
            step_execution.context.put("checkpoint", 5);
            if self.fail.get() {
                step_execution.status = BatchStatus::Failed;
                return Err(BatchError::Step {
                    name: self.name.to_string(),
                    detail: "boom".to_string(),
                });
            }
            step_execution.status = BatchStatus::Completed;
            Ok(())
        }

        fn allow_start_if_complete(&self) -> bool {
            self.rerun
        }
    }

    #[derive(Default)]
    struct StatusRecorder {
        seen: RefCell<Vec<String>>,
    }

    impl BeforeJob for StatusRecorder {
        fn before_job(&self, job_execution: &JobExecution) {
            self.seen
                .borrow_mut()
                .push(format!("before {:?}", job_execution.status));
        }
    }

    impl AfterJob for StatusRecorder {
        fn after_job(&self, job_execution: &JobExecution) {
            self.seen
                .borrow_mut()
                .push(format!("after {:?}", job_execution.status));
        }
    }

    fn execute(job: &dyn Job) -> JobExecution {
        let mut execution = JobExecution::new(job.get_name(), JobParameters::default());
        job.execute(&mut execution);
        execution
    }

    #[test]
    fn should_run_steps_in_order_and_complete() -> Result<(), BatchError> {
        let first = FakeStep::new("first", false);
        let second = FakeStep::new("second", false);
        let listener = StatusRecorder::default();
        let job = JobBuilder::new()
            .name("test")
            .start(&first)
            .next(&second)
            .listener(&listener)
            .build()?;

        let execution = execute(&job);

        assert_eq!(execution.status, BatchStatus::Completed);
        let names: Vec<_> = execution.step_executions.iter().map(|s| &s.name).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(execution.context.contains_key("first.ran"));
        assert!(execution.context.contains_key("second.ran"));
        assert_eq!(
            *listener.seen.borrow(),
            vec!["before Started", "after Completed"]
        );
        Ok(())
    }

    #[test]
    fn should_stop_at_first_failed_step() -> Result<(), BatchError> {
        let first = FakeStep::new("first", true);
        let second = FakeStep::new("second", false);
        let listener = StatusRecorder::default();
        let job = JobBuilder::new()
            .start(&first)
            .next(&second)
            .listener(&listener)
            .build()?;

        let execution = execute(&job);

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(second.runs.get(), 0);
        assert_eq!(execution.step_executions.len(), 1);
        assert!(execution.failure.as_deref().unwrap().contains("boom"));
        assert_eq!(
            *listener.seen.borrow(),
            vec!["before Started", "after Failed"]
        );
        Ok(())
    }

    #[test]
    fn restart_skips_completed_steps_and_resumes_failed_one() -> Result<(), BatchError> {
        let first = FakeStep::new("first", false);
        let second = FakeStep::new("second", true);
        let job = JobBuilder::new().start(&first).next(&second).build()?;

        let failed = execute(&job);
        assert_eq!(failed.status, BatchStatus::Failed);

        second.fail.set(false);
        let mut restarted = JobExecution::restart_of(&failed);
        assert!(restarted.is_restart());
        job.execute(&mut restarted);

        assert_eq!(restarted.status, BatchStatus::Completed);
        assert_eq!(first.runs.get(), 1);
        assert_eq!(second.runs.get(), 2);
        let resumed_from = second.seen_context.borrow().clone().unwrap();
        assert_eq!(resumed_from.get_u64("checkpoint"), Some(5));
        Ok(())
    }

    #[test]
    fn restart_runs_a_rerunnable_completed_step_from_scratch() -> Result<(), BatchError> {
        let first = FakeStep::rerunnable("first");
        let second = FakeStep::new("second", true);
        let job = JobBuilder::new().start(&first).next(&second).build()?;

        let failed = execute(&job);
        assert_eq!(failed.status, BatchStatus::Failed);
        let saved = &failed.step_execution("first").unwrap().context;
        assert_eq!(saved.get_u64("checkpoint"), Some(5));

        second.fail.set(false);
        let mut restarted = JobExecution::restart_of(&failed);
        job.execute(&mut restarted);

        assert_eq!(restarted.status, BatchStatus::Completed);
        assert_eq!(first.runs.get(), 2);
        let started_from = first.seen_context.borrow().clone().unwrap();
        assert!(started_from.is_empty());
        let resumed_from = second.seen_context.borrow().clone().unwrap();
        assert_eq!(resumed_from.get_u64("checkpoint"), Some(5));
        Ok(())
    }

    #[test]
    fn unnamed_jobs_get_a_generated_name() -> Result<(), BatchError> {
        let step = FakeStep::new("only", false);
        let first = JobBuilder::new().start(&step).build()?;
        let second = JobBuilder::new().start(&step).build()?;

        assert_eq!(first.get_name().len(), 8);
        assert!(first.get_name().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first.get_name(), second.get_name());
        Ok(())
    }

    #[test]
    fn should_reject_empty_jobs_and_duplicate_step_names() {
        let first = FakeStep::new("same", false);
        let second = FakeStep::new("same", false);

        let empty = JobBuilder::new().name("empty").build();
        let duplicated = JobBuilder::new().start(&first).next(&second).build();

        assert!(matches!(empty, Err(BatchError::Configuration(_))));
        assert!(matches!(duplicated, Err(BatchError::Configuration(_))));
    }
}

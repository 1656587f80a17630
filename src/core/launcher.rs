use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use log::{error, info};

use crate::error::BatchError;

use super::{
    job::{Job, JobExecution},
    step::BatchStatus,
};

/// Key under which the launcher stores the launch time in every job context.
pub const LAUNCH_TIME_KEY: &str = "launch.time";

/// A single job parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum JobParameter {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl fmt::Display for JobParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobParameter::String(value) => write!(f, "{value}(string)"),
            JobParameter::Long(value) => write!(f, "{value}(long)"),
            JobParameter::Double(value) => write!(f, "{value}(double)"),
            JobParameter::Date(value) => write!(f, "{}(date)", value.to_rfc3339()),
        }
    }
}

/// Parameters identifying one run of a job.
///
/// Two launches of the same job with equal parameters address the same job instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.parameters.get(key) {
            Some(JobParameter::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.parameters.get(key) {
            Some(JobParameter::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Canonical form used to recognise identical parameter sets.
    pub fn identifying_key(&self) -> String {
        self.parameters
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.identifying_key())
    }
}

#[derive(Debug, Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::String(value.to_string()));
        self
    }

    pub fn add_long(mut self, key: &str, value: i64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Long(value));
        self
    }

    pub fn add_double(mut self, key: &str, value: f64) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Double(value));
        self
    }

    pub fn add_date(mut self, key: &str, value: DateTime<Utc>) -> Self {
        self.parameters
            .insert(key.to_string(), JobParameter::Date(value));
        self
    }

    /// Adds `time` set to the current epoch milliseconds, making the run unique.
    pub fn add_current_time(self) -> Self {
        self.add_long("time", Utc::now().timestamp_millis())
    }

    pub fn to_job_parameters(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

/// Key of the run counter maintained by [`RunIdIncrementer`].
pub const RUN_ID_KEY: &str = "run.id";

/// Derives the parameters of the next run of a job from those of its last run.
pub trait JobParametersIncrementer: Send + Sync {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters;
}

/// Keeps the previous parameters and bumps `run.id`, starting at 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunIdIncrementer;

impl JobParametersIncrementer for RunIdIncrementer {
    fn next(&self, previous: Option<&JobParameters>) -> JobParameters {
        let mut parameters = previous.cloned().unwrap_or_default();
        let run_id = parameters.get_long(RUN_ID_KEY).unwrap_or(0) + 1;
        parameters
            .parameters
            .insert(RUN_ID_KEY.to_string(), JobParameter::Long(run_id));
        parameters
    }
}

/// What a launch does when the job already ran with identical parameters.
///
/// A launch matching an execution that is still running is always rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateRunPolicy {
    /// Any earlier execution with the same parameters rejects the launch.
    #[default]
    RejectDuplicates,
    /// A failed execution is restarted; a completed one rejects the launch.
    RestartFailed,
}

/// Stores job executions and guards launches.
pub trait JobRepository: Send + Sync {
    /// Registers a new execution of `job_name` with `parameters`.
    ///
    /// Checking previous executions and registering the new one happen atomically, so two
    /// concurrent launches with identical parameters cannot both succeed.
    ///
    /// # Errors
    ///
    /// `BatchError::Launch` when `policy` forbids running these parameters again.
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        policy: DuplicateRunPolicy,
    ) -> Result<JobExecution, BatchError>;

    /// Saves the current state of `execution`.
    fn update(&self, execution: &JobExecution) -> Result<(), BatchError>;

    fn last_job_execution(&self, job_name: &str, parameters: &JobParameters)
    -> Option<JobExecution>;

    /// Parameters of the most recently launched execution of `job_name`.
    fn last_parameters(&self, job_name: &str) -> Option<JobParameters>;
}

/// Process-local [`JobRepository`]. Executions are lost when the process exits.
#[derive(Default)]
pub struct InMemoryJobRepository {
    executions: Mutex<HashMap<(String, String), Vec<JobExecution>>>,
    latest_parameters: Mutex<HashMap<String, JobParameters>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<JobExecution>>>, BatchError>
    {
        self.executions
            .lock()
            .map_err(|_| BatchError::Launch("job repository lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        policy: DuplicateRunPolicy,
    ) -> Result<JobExecution, BatchError> {
        let key = (job_name.to_string(), parameters.identifying_key());
        let mut executions = self.lock()?;
        let history = executions.entry(key).or_default();

        let execution = match history.last() {
            None => JobExecution::new(job_name, parameters.clone()),
            Some(last) if !last.status.is_finished() => {
                return Err(BatchError::Launch(format!(
                    "job {job_name} is already running with parameters {parameters}"
                )));
            }
            Some(last) => match policy {
                DuplicateRunPolicy::RejectDuplicates => {
                    return Err(BatchError::Launch(format!(
                        "job {job_name} already ran with parameters {parameters} ({:?})",
                        last.status
                    )));
                }
                DuplicateRunPolicy::RestartFailed if last.status == BatchStatus::Completed => {
                    return Err(BatchError::Launch(format!(
                        "job {job_name} already completed with parameters {parameters}"
                    )));
                }
                DuplicateRunPolicy::RestartFailed => {
                    info!("Restarting failed execution {} of job {}", last.id, job_name);
                    JobExecution::restart_of(last)
                }
            },
        };

        history.push(execution.clone());
        self.latest_parameters
            .lock()
            .map_err(|_| BatchError::Launch("job repository lock poisoned".to_string()))?
            .insert(job_name.to_string(), parameters.clone());
        Ok(execution)
    }

    fn update(&self, execution: &JobExecution) -> Result<(), BatchError> {
        let key = (
            execution.job_name.clone(),
            execution.parameters.identifying_key(),
        );
        let mut executions = self.lock()?;
        let history = executions.entry(key).or_default();

        match history.iter_mut().find(|stored| stored.id == execution.id) {
            Some(stored) => *stored = execution.clone(),
            None => history.push(execution.clone()),
        }
        Ok(())
    }

    fn last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Option<JobExecution> {
        let key = (job_name.to_string(), parameters.identifying_key());
        self.lock()
            .ok()?
            .get(&key)
            .and_then(|history| history.last().cloned())
    }

    fn last_parameters(&self, job_name: &str) -> Option<JobParameters> {
        self.latest_parameters.lock().ok()?.get(job_name).cloned()
    }
}

/// Entry point running jobs synchronously.
///
/// A launcher can be cloned and shared between threads; every launch gets its own
/// [`JobExecution`] and execution context.
#[derive(Clone)]
pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
    policy: DuplicateRunPolicy,
}

impl Default for JobLauncher {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryJobRepository::new()))
    }
}

impl JobLauncher {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            policy: DuplicateRunPolicy::default(),
        }
    }

    pub fn policy(mut self, policy: DuplicateRunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Parameters for the next run of `job_name`: `incrementer` applied to the parameters
    /// of its last launch, with `additional` added on top.
    pub fn next_parameters(
        &self,
        job_name: &str,
        incrementer: &dyn JobParametersIncrementer,
        additional: JobParameters,
    ) -> JobParameters {
        let previous = self.repository.last_parameters(job_name);
        let mut next = incrementer.next(previous.as_ref());
        next.parameters.extend(additional.parameters);
        next
    }

    /// Launches a new run of `job` with [`next_parameters`](Self::next_parameters).
    ///
    /// Concurrent calls may derive the same parameters, in which case all but one are
    /// rejected by the repository.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn run_next(
        &self,
        job: &dyn Job,
        incrementer: &dyn JobParametersIncrementer,
        additional: JobParameters,
    ) -> Result<JobExecution, BatchError> {
        let parameters = self.next_parameters(job.get_name(), incrementer, additional);
        self.run(job, parameters)
    }

    /// Runs `job` to completion and returns its execution.
    ///
    /// A failed job is not an error here: inspect `status` and `failure` on the returned
    /// execution.
    ///
    /// # Errors
    ///
    /// `BatchError::Launch` when the job cannot start with `parameters`.
    pub fn run(
        &self,
        job: &dyn Job,
        parameters: JobParameters,
    ) -> Result<JobExecution, BatchError> {
        let mut execution =
            self.repository
                .create_job_execution(job.get_name(), &parameters, self.policy)?;

        execution
            .context
            .put(LAUNCH_TIME_KEY, Utc::now().to_rfc3339());

        info!(
            "Launching job {} with parameters {}",
            job.get_name(),
            parameters
        );

        job.execute(&mut execution);

        if let Err(error) = self.repository.update(&execution) {
            error!("Unable to save execution {}: {}", execution.id, error);
        }

        info!(
            "Job {} finished with status {:?}",
            job.get_name(),
            execution.status
        );

        Ok(execution)
    }
}

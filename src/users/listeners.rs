use log::{error, info};

use crate::core::{
    job::JobExecution,
    listener::{AfterJob, AfterStep, BeforeJob, BeforeStep},
    step::{BatchStatus, StepExecution},
};

/// Logs when a step starts and how it ended.
#[derive(Default)]
pub struct StepLoggerListener;

impl BeforeStep for StepLoggerListener {
    fn before_step(&self, step_execution: &StepExecution) {
        info!(
            "Step STARTED: {} at {}",
            step_execution.name,
            format_time(step_execution.start_time)
        );
    }
}

impl AfterStep for StepLoggerListener {
    fn after_step(&self, step_execution: &StepExecution) {
        info!(
            "Step {:?}: {} at {} | read: {}, written: {}, skipped: {}, commits: {}, rollbacks: {}",
            step_execution.status,
            step_execution.name,
            format_time(step_execution.end_time),
            step_execution.read_count,
            step_execution.write_count,
            step_execution.skip_count(),
            step_execution.commit_count,
            step_execution.rollback_count
        );
    }
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|time| time.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

/// Delivers the message sent when a job completes successfully.
pub trait Notifier {
    fn notify(&self, message: &str);
}

/// Notifier writing to the log.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!("Notification: {message}");
    }
}

/// Announces the job start, notifies on success and reports failures.
pub struct JobCompletionNotificationListener<N: Notifier = LogNotifier> {
    notifier: N,
}

impl<N: Notifier> JobCompletionNotificationListener<N> {
    pub fn new(notifier: N) -> Self {
        Self { notifier }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}

impl Default for JobCompletionNotificationListener {
    fn default() -> Self {
        Self::new(LogNotifier)
    }
}

impl<N: Notifier> BeforeJob for JobCompletionNotificationListener<N> {
    fn before_job(&self, job_execution: &JobExecution) {
        info!(
            "Job {} started with parameters {}",
            job_execution.job_name, job_execution.parameters
        );
    }
}

impl<N: Notifier> AfterJob for JobCompletionNotificationListener<N> {
    fn after_job(&self, job_execution: &JobExecution) {
        if job_execution.status == BatchStatus::Completed {
            info!("Job {} finished, sending notification", job_execution.job_name);
            self.notifier.notify(&format!(
                "Batch {} completed successfully",
                job_execution.job_name
            ));
        } else {
            error!(
                "Job {} failed: {}. Please check logs.",
                job_execution.job_name,
                job_execution.failure.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

//! The user job: CSV file into the `app_user` table, then `app_user` into a flat file.

pub mod config;

pub mod job;

/// Step logger and job completion listeners
pub mod listeners;

pub mod model;

pub use config::Config;
pub use job::{UserJob, connect, init_schema, run_full_job, run_user_job};
pub use listeners::{JobCompletionNotificationListener, LogNotifier, Notifier, StepLoggerListener};
pub use model::{User, UserBinder};

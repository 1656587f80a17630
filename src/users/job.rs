use clap::ValueEnum;
use log::info;
use sqlx::SqlitePool;

use crate::{
    core::{
        job::{JobBuilder, JobExecution},
        launcher::{JobLauncher, JobParameters},
        step::StepBuilder,
    },
    error::BatchError,
    item::{
        csv::{csv_reader::CsvItemReaderBuilder, csv_writer::CsvItemWriterBuilder},
        rdbc::{SqliteItemReaderBuilder, SqliteItemWriterBuilder},
    },
};

use super::{
    config::Config,
    listeners::{JobCompletionNotificationListener, Notifier, StepLoggerListener},
    model::{User, UserBinder},
};

pub const JOB_NAME: &str = "fullJob";
pub const IMPORT_JOB_NAME: &str = "importUserJob";
pub const EXPORT_JOB_NAME: &str = "exportUsersToExcelJob";
pub const IMPORT_STEP_NAME: &str = "importsUsersCSVToDatabase";
pub const EXPORT_STEP_NAME: &str = "exportUsersToExcelStep";

/// Which of the user jobs to launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum UserJob {
    /// Import then export, notifying on completion
    #[default]
    Full,
    /// CSV into `app_user` only
    Import,
    /// `app_user` into the output file only
    Export,
}

impl UserJob {
    pub fn name(self) -> &'static str {
        match self {
            UserJob::Full => JOB_NAME,
            UserJob::Import => IMPORT_JOB_NAME,
            UserJob::Export => EXPORT_JOB_NAME,
        }
    }
}

const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS app_user (id INTEGER PRIMARY KEY, name TEXT, email TEXT)";

// primary key order keeps the export deterministic and the paging stable
const EXPORT_QUERY: &str = "SELECT id, name, email FROM app_user ORDER BY id";

/// Opens a connection pool on `database_url`.
pub async fn connect(database_url: &str) -> Result<SqlitePool, BatchError> {
    SqlitePool::connect(database_url)
        .await
        .map_err(|error| BatchError::Configuration(format!("cannot open {database_url}: {error}")))
}

/// Creates the `app_user` table if it does not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), BatchError> {
    sqlx::query(CREATE_TABLE)
        .execute(pool)
        .await
        .map_err(|error| BatchError::Configuration(format!("cannot create app_user: {error}")))?;
    Ok(())
}

/// Assembles `fullJob` and launches it with `parameters`.
///
/// 1. `importsUsersCSVToDatabase`: `config.input` (header skipped) into `app_user`
/// 2. `exportUsersToExcelStep`: every `app_user` row, in `id` order, into `config.output`
///
/// Must be called from a multi-threaded tokio runtime.
///
/// # Errors
///
/// `BatchError::Launch` when `launcher` refuses `parameters`, `BatchError::Configuration`
/// when the job cannot be assembled. A job that runs and fails is returned as an
/// execution with status `Failed`.
pub fn run_full_job<N: Notifier>(
    config: &Config,
    pool: &SqlitePool,
    launcher: &JobLauncher,
    parameters: JobParameters,
    notifier: N,
) -> Result<JobExecution, BatchError> {
    run_user_job(UserJob::Full, config, pool, launcher, parameters, notifier)
}

/// Assembles the job selected by `job` and launches it with `parameters`.
///
/// `importUserJob` and `exportUsersToExcelJob` run one step of `fullJob` on their own;
/// only `fullJob` reports to `notifier`.
///
/// # Errors
///
/// Same as [`run_full_job`].
pub fn run_user_job<N: Notifier>(
    job: UserJob,
    config: &Config,
    pool: &SqlitePool,
    launcher: &JobLauncher,
    parameters: JobParameters,
    notifier: N,
) -> Result<JobExecution, BatchError> {
    let step_logger = StepLoggerListener;
    let completion_listener = JobCompletionNotificationListener::new(notifier);

    let csv_reader = CsvItemReaderBuilder::new()
        .name("userCsvReader")
        .has_headers(true)
        .from_path(&config.input);
    let database_writer = SqliteItemWriterBuilder::new()
        .pool(pool)
        .table("app_user")
        .add_column("id")
        .add_column("name")
        .add_column("email")
        .item_binder(&UserBinder)
        .build()?;

    let mut import_builder = StepBuilder::<User, User>::new(IMPORT_STEP_NAME)
        .reader(&csv_reader)
        .writer(&database_writer)
        .chunk(config.chunk_size)
        .listener(&step_logger);
    if config.skip_limit > 0 {
        import_builder = import_builder.skip_limit(config.skip_limit);
    }
    let import_step = import_builder.build()?;

    let database_reader = SqliteItemReaderBuilder::new()
        .name("userReader")
        .pool(pool)
        .query(EXPORT_QUERY)
        .page_size(config.chunk_size.into())
        .build::<User>()?;
    let file_writer = CsvItemWriterBuilder::new()
        .name("userFileWriter")
        .from_path(&config.output);

    let export_step = StepBuilder::<User, User>::new(EXPORT_STEP_NAME)
        .reader(&database_reader)
        .writer(&file_writer)
        .chunk(config.chunk_size)
        .listener(&step_logger)
        .build()?;

    let builder = JobBuilder::new().name(job.name());
    let user_job = match job {
        UserJob::Full => builder
            .start(&import_step)
            .next(&export_step)
            .listener(&completion_listener),
        UserJob::Import => builder.start(&import_step),
        UserJob::Export => builder.start(&export_step),
    }
    .build()?;

    info!(
        "Running {} from {} to {}",
        job.name(),
        config.input.display(),
        config.output.display()
    );

    launcher.run(&user_job, parameters)
}

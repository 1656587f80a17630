use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use user_batch::{
    core::{
        launcher::{JobLauncher, JobParametersBuilder, RunIdIncrementer},
        step::BatchStatus,
    },
    users::{Config, LogNotifier, connect, init_schema, run_user_job},
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    match run(&config).await {
        Ok(status) => exit_code(status),
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

/// Only a completed job exits with 0.
fn exit_code(status: BatchStatus) -> ExitCode {
    match status {
        BatchStatus::Completed => ExitCode::SUCCESS,
        status => {
            error!("Job ended with status {status:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> anyhow::Result<BatchStatus> {
    let pool = connect(&config.database_url).await?;
    init_schema(&pool).await?;

    let launcher = JobLauncher::default();
    let parameters = launcher.next_parameters(
        config.job.name(),
        &RunIdIncrementer,
        JobParametersBuilder::new()
            .add_current_time()
            .to_job_parameters(),
    );

    let execution = run_user_job(
        config.job,
        config,
        &pool,
        &launcher,
        parameters,
        LogNotifier,
    )?;

    info!(
        "Job {} ({}) took {} ms",
        execution.job_name,
        execution.id,
        execution
            .duration()
            .map(|duration| duration.num_milliseconds())
            .unwrap_or_default()
    );

    pool.close().await;
    Ok(execution.status)
}

use std::path::PathBuf;

use clap::Parser;

use super::job::UserJob;

/// Imports users from a CSV file into SQLite, then exports them to a flat file.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Job to launch
    #[arg(long, env = "USER_BATCH_JOB", value_enum, default_value_t = UserJob::Full)]
    pub job: UserJob,

    /// CSV file to import, with a header row and `id,name,email` columns
    #[arg(long, env = "USER_BATCH_INPUT", default_value = "data/users.csv")]
    pub input: PathBuf,

    /// File receiving the exported users, overwritten on every run
    #[arg(long, env = "USER_BATCH_OUTPUT", default_value = "users.txt")]
    pub output: PathBuf,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://users.db?mode=rwc")]
    pub database_url: String,

    /// Number of users committed per transaction
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u16).range(1..))]
    pub chunk_size: u16,

    /// Number of bad users tolerated before a step fails
    #[arg(long, default_value_t = 0)]
    pub skip_limit: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_option_has_a_default() {
        let config = Config::try_parse_from(["user-batch"]).unwrap();

        assert_eq!(config.chunk_size, 5);
        assert_eq!(config.skip_limit, 0);
        assert_eq!(config.job, UserJob::Full);
    }

    #[test]
    fn single_step_jobs_can_be_selected() {
        let config = Config::try_parse_from(["user-batch", "--job", "export"]).unwrap();

        assert_eq!(config.job, UserJob::Export);
        assert!(Config::try_parse_from(["user-batch", "--job", "excel"]).is_err());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let result = Config::try_parse_from(["user-batch", "--chunk-size", "0"]);

        assert!(result.is_err());
    }

    #[test]
    fn command_definition_is_valid() {
        use clap::CommandFactory;
        Config::command().debug_assert();
    }
}

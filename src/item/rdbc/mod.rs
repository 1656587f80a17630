//! Relational database items backed by `sqlx`.
//!
//! The item traits are synchronous while `sqlx` is async: every database call runs through
//! [`tokio::task::block_in_place`] on the current runtime, which must therefore be a
//! multi-threaded tokio runtime.

use std::future::Future;

use sqlx::{Database, query_builder::Separated};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::BatchError;

#[cfg(feature = "rdbc-sqlite")]
pub mod sqlite_reader;

#[cfg(feature = "rdbc-sqlite")]
pub mod sqlite_writer;

#[cfg(feature = "rdbc-sqlite")]
pub use sqlite_reader::{SqliteItemReader, SqliteItemReaderBuilder};
#[cfg(feature = "rdbc-sqlite")]
pub use sqlite_writer::{SqliteItemWriter, SqliteItemWriterBuilder};

/// Binds the fields of an item to the parameters of one `VALUES` row.
///
/// Fields must be bound in the order of the writer's columns.
///
/// ```
/// use user_batch::item::rdbc::DatabaseItemBinder;
/// use sqlx::{query_builder::Separated, Sqlite};
///
/// struct City {
///     id: i64,
///     name: String,
/// }
///
/// struct CityBinder;
///
/// impl DatabaseItemBinder<City, Sqlite> for CityBinder {
///     fn bind(&self, item: &City, mut query_builder: Separated<Sqlite, &str>) {
///         query_builder.push_bind(item.id);
///         query_builder.push_bind(item.name.clone());
///     }
/// }
/// ```
pub trait DatabaseItemBinder<O, DB: Database> {
    fn bind(&self, item: &O, query_builder: Separated<DB, &str>);
}

/// Runs `future` to completion from synchronous code inside a tokio runtime.
///
/// # Errors
///
/// `BatchError::Configuration` when called outside a multi-threaded tokio runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, BatchError> {
    let handle = Handle::try_current().map_err(|error| {
        BatchError::Configuration(format!("database items need a tokio runtime: {error}"))
    })?;

    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
        return Err(BatchError::Configuration(
            "database items need a multi-threaded tokio runtime".to_string(),
        ));
    }

    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_outside_a_runtime_is_a_configuration_error() {
        let result = block_on(async { 1 });

        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }

    #[tokio::test]
    async fn block_on_refuses_current_thread_runtime() {
        let result = block_on(async { 1 });

        assert!(matches!(
            result,
            Err(BatchError::Configuration(msg)) if msg.contains("multi-threaded")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn block_on_runs_the_future() {
        assert_eq!(block_on(async { 21 * 2 }).unwrap(), 42);
    }
}

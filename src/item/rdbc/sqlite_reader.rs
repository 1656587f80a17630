use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

use log::debug;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite, sqlite::SqliteRow};

use crate::{
    core::{
        context::ExecutionContext,
        item::{ItemReader, ItemReaderResult},
    },
    error::BatchError,
};

use super::block_on;

/// Reads the rows of a query page by page.
///
/// The base query is run with `LIMIT page_size OFFSET n` appended, so it must have a
/// deterministic `ORDER BY` for paging to be stable. Only one page is held in memory.
///
/// The number of rows returned so far is saved as `<name>.read.count` in the step context;
/// on restart `open` resumes at that offset.
pub struct SqliteItemReader<'a, I> {
    name: String,
    pool: &'a Pool<Sqlite>,
    query: String,
    page_size: u32,
    /// Rows handed out since the start of the result set
    position: Cell<u64>,
    buffer: RefCell<VecDeque<I>>,
    exhausted: Cell<bool>,
}

impl<I> SqliteItemReader<'_, I>
where
    for<'r> I: FromRow<'r, SqliteRow> + Send + Unpin,
{
    pub fn get_name(&self) -> &str {
        &self.name
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    fn read_page(&self) -> Result<(), BatchError> {
        let offset = self.position.get();

        let mut query_builder = QueryBuilder::<Sqlite>::new(&self.query);
        query_builder
            .push(" LIMIT ")
            .push_bind(i64::from(self.page_size))
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let items = block_on(async {
            query_builder
                .build_query_as::<I>()
                .fetch_all(self.pool)
                .await
        })?
        .map_err(|error| BatchError::ItemReader(format!("{} failed: {}", self.name, error)))?;

        debug!(
            "Reader {} fetched {} rows at offset {}",
            self.name,
            items.len(),
            offset
        );

        if items.len() < self.page_size as usize {
            self.exhausted.set(true);
        }
        self.buffer.borrow_mut().extend(items);
        Ok(())
    }
}

impl<I> ItemReader<I> for SqliteItemReader<'_, I>
where
    for<'r> I: FromRow<'r, SqliteRow> + Send + Unpin,
{
    fn open(&self, context: &ExecutionContext) -> Result<(), BatchError> {
        self.position
            .set(context.get_u64(&self.position_key()).unwrap_or(0));
        self.buffer.borrow_mut().clear();
        self.exhausted.set(false);
        Ok(())
    }

    fn read(&self) -> ItemReaderResult<I> {
        if self.buffer.borrow().is_empty() {
            if self.exhausted.get() {
                return Ok(None);
            }
            self.read_page()?;
        }

        let item = self.buffer.borrow_mut().pop_front();
        if item.is_some() {
            self.position.set(self.position.get() + 1);
        }
        Ok(item)
    }

    fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
        context.put(self.position_key(), self.position.get());
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        self.buffer.borrow_mut().clear();
        Ok(())
    }
}

/// Builder for a [`SqliteItemReader`]. The page size defaults to 10.
pub struct SqliteItemReaderBuilder<'a> {
    name: String,
    pool: Option<&'a Pool<Sqlite>>,
    query: Option<String>,
    page_size: u32,
}

impl Default for SqliteItemReaderBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> SqliteItemReaderBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: "sqliteItemReader".to_string(),
            pool: None,
            query: None,
            page_size: 10,
        }
    }

    /// Name used to key the reader state in the step context.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn pool(mut self, pool: &'a Pool<Sqlite>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Base `SELECT`, without `LIMIT` or `OFFSET`.
    pub fn query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// # Errors
    ///
    /// `BatchError::Configuration` when the pool or the query is missing or the page size is
    /// zero.
    pub fn build<I>(self) -> Result<SqliteItemReader<'a, I>, BatchError>
    where
        for<'r> I: FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let pool = self.pool.ok_or_else(|| {
            BatchError::Configuration(format!("reader {}: no pool configured", self.name))
        })?;
        let query = self.query.ok_or_else(|| {
            BatchError::Configuration(format!("reader {}: no query configured", self.name))
        })?;
        if self.page_size == 0 {
            return Err(BatchError::Configuration(format!(
                "reader {}: page size must be greater than zero",
                self.name
            )));
        }

        Ok(SqliteItemReader {
            name: self.name,
            pool,
            query,
            page_size: self.page_size,
            position: Cell::new(0),
            buffer: RefCell::new(VecDeque::with_capacity(self.page_size as usize)),
            exhausted: Cell::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use sqlx::{SqlitePool, sqlite::SqliteConnectOptions};
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, FromRow, PartialEq)]
    struct City {
        id: i64,
        name: String,
    }

    async fn pool_with_cities(dir: &TempDir, count: i64) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("cities.db"))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query("CREATE TABLE city (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&pool)
            .await?;
        for id in 1..=count {
            sqlx::query("INSERT INTO city (id, name) VALUES (?, ?)")
                .bind(id)
                .bind(format!("city {id}"))
                .execute(&pool)
                .await?;
        }
        Ok(pool)
    }

    fn read_ids(reader: &SqliteItemReader<City>) -> Result<Vec<i64>, BatchError> {
        let mut ids = Vec::new();
        while let Some(city) = reader.read()? {
            ids.push(city.id);
        }
        Ok(ids)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_read_every_row_across_pages_in_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = pool_with_cities(&dir, 7).await?;
        let reader = SqliteItemReaderBuilder::new()
            .pool(&pool)
            .query("SELECT id, name FROM city ORDER BY id")
            .page_size(3)
            .build::<City>()?;

        reader.open(&ExecutionContext::new())?;

        assert_eq!(read_ids(&reader)?, (1..=7).collect::<Vec<_>>());
        // end of stream is sticky
        assert!(reader.read()?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exact_page_multiple_ends_with_an_empty_page() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = pool_with_cities(&dir, 4).await?;
        let reader = SqliteItemReaderBuilder::new()
            .pool(&pool)
            .query("SELECT id, name FROM city ORDER BY id")
            .page_size(2)
            .build::<City>()?;

        reader.open(&ExecutionContext::new())?;

        assert_eq!(read_ids(&reader)?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_resumes_from_the_saved_position() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = pool_with_cities(&dir, 5).await?;
        let reader = SqliteItemReaderBuilder::new()
            .name("userReader")
            .pool(&pool)
            .query("SELECT id, name FROM city ORDER BY id")
            .build::<City>()?;
        let mut context = ExecutionContext::new();
        context.put("userReader.read.count", 3);

        reader.open(&context)?;
        let first = reader.read()?.unwrap();
        reader.update(&mut context)?;

        assert_eq!(first.id, 4);
        assert_eq!(context.get_u64("userReader.read.count"), Some(4));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_query_is_a_read_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = pool_with_cities(&dir, 1).await?;
        let reader = SqliteItemReaderBuilder::new()
            .pool(&pool)
            .query("SELECT id, name FROM missing_table")
            .build::<City>()?;

        reader.open(&ExecutionContext::new())?;

        assert!(matches!(reader.read(), Err(BatchError::ItemReader(_))));
        Ok(())
    }

    #[test]
    fn missing_pool_or_query_is_a_configuration_error() {
        let no_pool = SqliteItemReaderBuilder::new()
            .query("SELECT 1")
            .build::<City>();
        let no_query = SqliteItemReaderBuilder::new().build::<City>();

        assert!(matches!(no_pool, Err(BatchError::Configuration(_))));
        assert!(matches!(no_query, Err(BatchError::Configuration(_))));
    }
}

use log::{debug, error};
use sqlx::{Pool, QueryBuilder, Sqlite, Transaction};

use crate::{
    core::{
        item::{ItemWriter, ItemWriterResult},
        transaction::{ChunkTransaction, TransactionalResource},
    },
    error::BatchError,
};

use super::{DatabaseItemBinder, block_on};

// SQLite's default SQLITE_MAX_VARIABLE_NUMBER
const BIND_LIMIT: usize = 32766;

/// Inserts items with parameterized multi-row `INSERT` statements.
///
/// Each chunk runs inside its own database transaction. The statements are executed in
/// [`ItemWriter::write`], so constraint violations surface there, but nothing becomes
/// visible to other connections before the chunk transaction commits. A chunk larger
/// than the bind parameter limit is split over several statements within the same
/// transaction.
pub struct SqliteItemWriter<'a, O> {
    pool: &'a Pool<Sqlite>,
    table: String,
    columns: Vec<String>,
    item_binder: &'a dyn DatabaseItemBinder<O, Sqlite>,
}

/// Open database transaction holding one chunk's rows.
struct PendingInsert {
    transaction: Transaction<'static, Sqlite>,
    table: String,
    rows: usize,
}

impl TransactionalResource for PendingInsert {
    fn commit(self: Box<Self>) -> Result<(), BatchError> {
        let PendingInsert {
            transaction,
            table,
            rows,
        } = *self;

        block_on(transaction.commit())?.map_err(|error| {
            BatchError::ItemWriter(format!("commit into {table} failed: {error}"))
        })?;
        debug!("Committed {} rows into {}", rows, table);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), BatchError> {
        let PendingInsert {
            transaction, table, ..
        } = *self;

        block_on(transaction.rollback())?.map_err(|error| {
            BatchError::ItemWriter(format!("rollback of {table} failed: {error}"))
        })
    }
}

impl<O> SqliteItemWriter<'_, O> {
    fn insert_all(
        &self,
        transaction: &mut Transaction<'static, Sqlite>,
        items: &[O],
    ) -> Result<(), BatchError> {
        let rows_per_statement = (BIND_LIMIT / self.columns.len()).max(1);

        for batch in items.chunks(rows_per_statement) {
            let mut query_builder = QueryBuilder::<Sqlite>::new("INSERT INTO ");
            query_builder.push(&self.table);
            query_builder.push(" (");
            query_builder.push(self.columns.join(","));
            query_builder.push(") ");

            query_builder.push_values(batch, |b, item| {
                self.item_binder.bind(item, b);
            });

            let query = query_builder.build();
            block_on(query.execute(&mut **transaction))?
                .map_err(|error| BatchError::ItemWriter(format!("SQLite write failed: {error}")))?;
        }
        Ok(())
    }
}

impl<O> ItemWriter<O> for SqliteItemWriter<'_, O> {
    fn write<'t>(
        &'t self,
        items: &[O],
        transaction: &mut ChunkTransaction<'t>,
    ) -> ItemWriterResult {
        if items.is_empty() {
            return Ok(());
        }

        let mut database_transaction = block_on(self.pool.begin())?.map_err(|error| {
            BatchError::ItemWriter(format!("cannot begin transaction: {error}"))
        })?;

        if let Err(error) = self.insert_all(&mut database_transaction, items) {
            error!(
                "Failed to write {} items to SQLite table {}: {}",
                items.len(),
                self.table,
                error
            );
            if let Err(rollback_error) = block_on(database_transaction.rollback())? {
                error!("Rollback of table {} failed: {}", self.table, rollback_error);
            }
            return Err(error);
        }

        debug!(
            "Inserted {} rows into {} for chunk {}, pending commit",
            items.len(),
            self.table,
            transaction.chunk()
        );

        transaction.enlist(PendingInsert {
            transaction: database_transaction,
            table: self.table.clone(),
            rows: items.len(),
        });
        Ok(())
    }
}

/// Builder for a [`SqliteItemWriter`].
///
/// ```no_run
/// use user_batch::item::rdbc::{DatabaseItemBinder, SqliteItemWriterBuilder};
/// use sqlx::{query_builder::Separated, Sqlite, SqlitePool};
///
/// struct Product {
///     id: i64,
///     name: String,
/// }
///
/// struct ProductBinder;
/// impl DatabaseItemBinder<Product, Sqlite> for ProductBinder {
///     fn bind(&self, item: &Product, mut query_builder: Separated<Sqlite, &str>) {
///         query_builder.push_bind(item.id);
///         query_builder.push_bind(item.name.clone());
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = SqlitePool::connect("sqlite://products.db").await?;
/// let binder = ProductBinder;
///
/// let writer = SqliteItemWriterBuilder::<Product>::new()
///     .pool(&pool)
///     .table("product")
///     .add_column("id")
///     .add_column("name")
///     .item_binder(&binder)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteItemWriterBuilder<'a, O> {
    pool: Option<&'a Pool<Sqlite>>,
    table: Option<String>,
    columns: Vec<String>,
    item_binder: Option<&'a dyn DatabaseItemBinder<O, Sqlite>>,
}

impl<O> Default for SqliteItemWriterBuilder<'_, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, O> SqliteItemWriterBuilder<'a, O> {
    pub fn new() -> Self {
        Self {
            pool: None,
            table: None,
            columns: Vec::new(),
            item_binder: None,
        }
    }

    pub fn pool(mut self, pool: &'a Pool<Sqlite>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Adds a column. Columns are bound in the order they are added.
    pub fn add_column(mut self, column: &str) -> Self {
        self.columns.push(column.to_string());
        self
    }

    pub fn item_binder(mut self, item_binder: &'a dyn DatabaseItemBinder<O, Sqlite>) -> Self {
        self.item_binder = Some(item_binder);
        self
    }

    /// # Errors
    ///
    /// `BatchError::Configuration` when the pool, the table, the binder or every column is
    /// missing.
    pub fn build(self) -> Result<SqliteItemWriter<'a, O>, BatchError> {
        let pool = self
            .pool
            .ok_or_else(|| BatchError::Configuration("SQLite writer: no pool configured".into()))?;
        let table = self
            .table
            .ok_or_else(|| BatchError::Configuration("SQLite writer: no table configured".into()))?;
        let item_binder = self.item_binder.ok_or_else(|| {
            BatchError::Configuration(format!("SQLite writer for {table}: no binder configured"))
        })?;
        if self.columns.is_empty() {
            return Err(BatchError::Configuration(format!(
                "SQLite writer for {table}: at least one column is required"
            )));
        }

        Ok(SqliteItemWriter {
            pool,
            table,
            columns: self.columns,
            item_binder,
        })
    }
}

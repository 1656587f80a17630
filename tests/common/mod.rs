#![allow(dead_code)]

mod mocks;

use std::{
    cell::RefCell,
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub use mocks::MockFile;

use sqlx::SqlitePool;
use tempfile::TempDir;
use user_batch::{
    BatchError,
    core::{
        item::{ItemReader, ItemReaderResult, ItemWriter, ItemWriterResult},
        transaction::{ChunkTransaction, TransactionalResource},
    },
    users::{Config, Notifier, UserJob, connect, init_schema},
};

/// Writes `content` to `name` inside `dir` and returns its path.
pub fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).expect("cannot write test file");
    path
}

/// Opens a fresh database inside `dir`, with the `app_user` table created.
pub async fn database(dir: &TempDir) -> anyhow::Result<SqlitePool> {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("users.db").display());
    let pool = connect(&url).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn user_ids(pool: &SqlitePool) -> anyhow::Result<Vec<i64>> {
    Ok(sqlx::query_scalar("SELECT id FROM app_user ORDER BY id")
        .fetch_all(pool)
        .await?)
}

pub fn config(input: &Path, output: &Path, chunk_size: u16) -> Config {
    Config {
        job: UserJob::Full,
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        database_url: String::new(),
        chunk_size,
        skip_limit: 0,
    }
}

/// CSV content with a header row and one `i,user i,useri@x.com` row per id.
pub fn users_csv(ids: &[i64]) -> String {
    let mut csv = String::from("id,name,email\n");
    for id in ids {
        csv.push_str(&format!("{id},user {id},user{id}@x.com\n"));
    }
    csv
}

/// Notifier keeping every message.
#[derive(Default)]
pub struct RecordingNotifier<'a> {
    pub messages: Option<&'a RefCell<Vec<String>>>,
}

impl Notifier for RecordingNotifier<'_> {
    fn notify(&self, message: &str) {
        if let Some(messages) = self.messages {
            messages.borrow_mut().push(message.to_string());
        }
    }
}

/// Reads from a vector, optionally pausing before every item.
pub struct VecReader<T> {
    items: RefCell<VecDeque<T>>,
    pause: Duration,
}

impl<T> VecReader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self::slow(items, Duration::ZERO)
    }

    pub fn slow(items: Vec<T>, pause: Duration) -> Self {
        Self {
            items: RefCell::new(items.into()),
            pause,
        }
    }
}

impl<T> ItemReader<T> for VecReader<T> {
    fn read(&self) -> ItemReaderResult<T> {
        if !self.pause.is_zero() {
            std::thread::sleep(self.pause);
        }
        Ok(self.items.borrow_mut().pop_front())
    }
}

/// Collects committed items.
pub struct VecWriter<T> {
    pub items: RefCell<Vec<T>>,
}

impl<T> Default for VecWriter<T> {
    fn default() -> Self {
        Self {
            items: RefCell::new(Vec::new()),
        }
    }
}

struct StagedItems<'t, T> {
    items: Vec<T>,
    target: &'t RefCell<Vec<T>>,
}

impl<T> TransactionalResource for StagedItems<'_, T> {
    fn commit(self: Box<Self>) -> Result<(), BatchError> {
        self.target.borrow_mut().extend(self.items);
        Ok(())
    }
}

impl<T: Clone> ItemWriter<T> for VecWriter<T> {
    fn write<'t>(
        &'t self,
        items: &[T],
        transaction: &mut ChunkTransaction<'t>,
    ) -> ItemWriterResult {
        transaction.enlist(StagedItems {
            items: items.to_vec(),
            target: &self.items,
        });
        Ok(())
    }
}

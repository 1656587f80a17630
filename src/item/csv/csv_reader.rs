use csv::{ReaderBuilder, StringRecordsIntoIter, Terminator, Trim};
use log::debug;
use serde::de::DeserializeOwned;
use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use crate::{
    core::{
        context::ExecutionContext,
        item::{ItemReader, ItemReaderResult},
    },
    error::BatchError,
};

/// A CSV item reader that implements the `ItemReader` trait.
///
/// Rows are deserialized positionally (by column order, not by header name) one at a
/// time, so the file is streamed rather than loaded in memory.
///
/// # Restart
///
/// The number of rows consumed is saved in the step context under
/// `<name>.read.count` after every committed chunk. When the step is restarted, `open`
/// skips that many rows. A reader built with
/// [`CsvItemReaderBuilder::from_path`] reopens its file on every `open`, so one instance
/// can serve several step executions. One built with
/// [`CsvItemReaderBuilder::from_reader`] can only be read once.
///
/// # Examples
///
/// ```
/// use user_batch::item::csv::csv_reader::CsvItemReaderBuilder;
/// use user_batch::core::item::ItemReader;
/// use serde::Deserialize;
///
/// #[derive(Debug, Deserialize)]
/// struct Record {
///     name: String,
///     value: i32,
/// }
///
/// let data = "\
/// name,value
/// foo,123
/// bar,456
/// ";
///
/// let reader = CsvItemReaderBuilder::new()
///     .has_headers(true)
///     .from_reader(data.as_bytes());
///
/// let record: Record = reader.read().unwrap().unwrap();
/// assert_eq!(record.name, "foo");
/// assert_eq!(record.value, 123);
///
/// let record: Record = reader.read().unwrap().unwrap();
/// assert_eq!(record.value, 456);
///
/// assert!(ItemReader::<Record>::read(&reader).unwrap().is_none());
/// ```
pub struct CsvItemReader<R> {
    name: String,
    settings: Settings,
    /// Reopens the underlying source, set for path based readers only
    opener: Option<Opener<R>>,
    /// Iterator over the CSV records, `None` until a path based reader is opened
    records: RefCell<Option<StringRecordsIntoIter<R>>>,
    /// Rows consumed since the start of the input, failed rows included
    position: Cell<u64>,
}

type Opener<R> = Box<dyn Fn() -> Result<R, BatchError>>;

#[derive(Clone, Copy)]
struct Settings {
    delimiter: u8,
    terminator: Terminator,
    has_headers: bool,
}

impl Settings {
    fn reader_builder(&self) -> ReaderBuilder {
        let mut builder = ReaderBuilder::new();
        builder
            .trim(Trim::All)
            .delimiter(self.delimiter)
            .terminator(self.terminator)
            .has_headers(self.has_headers)
            // strict parsing: a row with missing or extra columns is an error
            .flexible(false);
        builder
    }
}

impl<R: Read> CsvItemReader<R> {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    fn reopen(&self) -> Result<(), BatchError> {
        if let Some(opener) = &self.opener {
            let source = opener()?;
            let records = self.settings.reader_builder().from_reader(source).into_records();
            *self.records.borrow_mut() = Some(records);
            self.position.set(0);
        }
        Ok(())
    }
}

impl<R: Read, T: DeserializeOwned> ItemReader<T> for CsvItemReader<R> {
    fn open(&self, context: &ExecutionContext) -> Result<(), BatchError> {
        self.reopen()?;

        let restart_position = context.get_u64(&self.position_key()).unwrap_or(0);
        if restart_position > self.position.get() {
            debug!("Reader {} skipping to row {}", self.name, restart_position);
        }

        let mut records = self.records.borrow_mut();
        let records = records
            .as_mut()
            .ok_or_else(|| BatchError::ItemReader(format!("reader {} has no input", self.name)))?;

        while self.position.get() < restart_position {
            if records.next().is_none() {
                break;
            }
            self.position.set(self.position.get() + 1);
        }
        Ok(())
    }

    /// Reads and deserializes the next row.
    ///
    /// # Returns
    /// - `Ok(Some(record))` if a record is successfully read
    /// - `Ok(None)` if there are no more records to read
    /// - `Err(BatchError::ItemReader(error))` if the row is malformed
    fn read(&self) -> ItemReaderResult<T> {
        let mut records = self.records.borrow_mut();
        let Some(records) = records.as_mut() else {
            return Err(BatchError::ItemReader(format!(
                "reader {} has not been opened",
                self.name
            )));
        };

        let Some(result) = records.next() else {
            return Ok(None);
        };
        self.position.set(self.position.get() + 1);

        let string_record = result.map_err(|error| BatchError::ItemReader(error.to_string()))?;
        string_record
            .deserialize(None)
            .map(Some)
            .map_err(|error| BatchError::ItemReader(error.to_string()))
    }

    fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
        context.put(self.position_key(), self.position.get());
        Ok(())
    }
}

/// A builder for configuring CSV item reading.
///
/// # Default Configuration
///
/// - Delimiter: comma (,)
/// - Terminator: CRLF, which accepts both `\r\n` and `\n`
/// - Headers: disabled
/// - Trimming: All fields trimmed
#[derive(Clone)]
pub struct CsvItemReaderBuilder {
    name: String,
    settings: Settings,
}

impl Default for CsvItemReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvItemReaderBuilder {
    pub fn new() -> Self {
        Self {
            name: "csvItemReader".to_string(),
            settings: Settings {
                delimiter: b',',
                terminator: Terminator::CRLF,
                has_headers: false,
            },
        }
    }

    /// Name used to key the reader state in the step context.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.settings.delimiter = delimiter;
        self
    }

    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.settings.terminator = terminator;
        self
    }

    /// When enabled, the first row is treated as a header and skipped.
    pub fn has_headers(mut self, yes: bool) -> Self {
        self.settings.has_headers = yes;
        self
    }

    /// Creates a `CsvItemReader` over any `Read` source. The source is read once.
    pub fn from_reader<R: Read>(self, rdr: R) -> CsvItemReader<R> {
        let records = self.settings.reader_builder().from_reader(rdr).into_records();

        CsvItemReader {
            name: self.name,
            settings: self.settings,
            opener: None,
            records: RefCell::new(Some(records)),
            position: Cell::new(0),
        }
    }

    /// Creates a `CsvItemReader` over a file. The file is opened, and reopened, by
    /// `ItemReader::open`; a missing file is reported there as `BatchError::ItemReader`.
    pub fn from_path<P: AsRef<Path>>(self, path: P) -> CsvItemReader<File> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let opener: Opener<File> = Box::new(move || {
            debug!("Opening {}", path.display());
            File::open(&path).map_err(|error| {
                BatchError::ItemReader(format!("cannot open {}: {}", path.display(), error))
            })
        });

        CsvItemReader {
            name: self.name,
            settings: self.settings,
            opener: Some(opener),
            records: RefCell::new(None),
            position: Cell::new(0),
        }
    }
}

use std::{
    cell::{Cell, RefCell},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use csv::WriterBuilder;
use log::debug;
use serde::Serialize;

use crate::{
    core::{
        context::ExecutionContext,
        item::{ItemWriter, ItemWriterResult},
        transaction::{ChunkTransaction, TransactionalResource},
    },
    error::BatchError,
};

/// Writes items as delimited lines.
///
/// A chunk is serialized into memory first; if any item fails to serialize, nothing of
/// the chunk reaches the output. The staged bytes are written and flushed when the chunk
/// commits.
///
/// A writer built with [`CsvItemWriterBuilder::from_path`] opens its file in `open`:
/// truncated on a fresh step execution, appended to when the step context shows that
/// lines were already committed by a previous execution.
pub struct CsvItemWriter<W: Write> {
    name: String,
    delimiter: u8,
    has_headers: bool,
    opener: Option<Opener<W>>,
    output: RefCell<Option<W>>,
    header_written: Cell<bool>,
    /// Lines committed since the output was created
    written: Cell<u64>,
}

/// Opens the destination; the flag tells whether to append.
type Opener<W> = Box<dyn Fn(bool) -> Result<W, BatchError>>;

/// Serialized chunk waiting for its transaction to commit.
struct StagedLines<'t, W: Write> {
    bytes: Vec<u8>,
    lines: u64,
    includes_header: bool,
    output: &'t RefCell<Option<W>>,
    header_written: &'t Cell<bool>,
    written: &'t Cell<u64>,
}

impl<W: Write> TransactionalResource for StagedLines<'_, W> {
    fn commit(self: Box<Self>) -> Result<(), BatchError> {
        let mut output = self.output.borrow_mut();
        let output = output
            .as_mut()
            .ok_or_else(|| BatchError::ItemWriter("writer has not been opened".to_string()))?;

        output
            .write_all(&self.bytes)
            .and_then(|()| output.flush())
            .map_err(|error| BatchError::ItemWriter(error.to_string()))?;

        if self.includes_header {
            self.header_written.set(true);
        }
        self.written.set(self.written.get() + self.lines);
        Ok(())
    }
}

impl<W: Write> CsvItemWriter<W> {
    fn position_key(&self) -> String {
        format!("{}.written", self.name)
    }

    /// Returns the underlying destination. Used for in-memory destinations.
    pub fn into_inner(self) -> Option<W> {
        self.output.into_inner()
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    fn stage<R: Serialize>(&self, items: &[R]) -> Result<(Vec<u8>, bool), BatchError> {
        let includes_header = self.has_headers && !self.header_written.get();
        let mut staging = WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(includes_header)
            .from_writer(Vec::new());

        for item in items {
            staging
                .serialize(item)
                .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        }

        let bytes = staging
            .into_inner()
            .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        Ok((bytes, includes_header))
    }
}

impl<W: Write, R: Serialize> ItemWriter<R> for CsvItemWriter<W> {
    fn open(&self, context: &ExecutionContext) -> Result<(), BatchError> {
        let committed = context.get_u64(&self.position_key()).unwrap_or(0);

        if let Some(opener) = &self.opener {
            let append = committed > 0;
            *self.output.borrow_mut() = Some(opener(append)?);
            self.header_written.set(append && self.has_headers);
            self.written.set(committed);
        }
        Ok(())
    }

    fn write<'t>(
        &'t self,
        items: &[R],
        transaction: &mut ChunkTransaction<'t>,
    ) -> ItemWriterResult {
        let (bytes, includes_header) = self.stage(items)?;
        debug!(
            "Staged {} lines ({} bytes) for chunk {}",
            items.len(),
            bytes.len(),
            transaction.chunk()
        );

        transaction.enlist(StagedLines {
            bytes,
            lines: items.len() as u64,
            includes_header,
            output: &self.output,
            header_written: &self.header_written,
            written: &self.written,
        });
        Ok(())
    }

    fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
        context.put(self.position_key(), self.written.get());
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        if let Some(output) = self.output.borrow_mut().as_mut() {
            output
                .flush()
                .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        }
        if self.opener.is_some() {
            // release the file handle; the next open recreates it
            self.output.borrow_mut().take();
        }
        Ok(())
    }
}

/// Builder for a [`CsvItemWriter`].
///
/// Defaults: delimiter `,`, no header row, lines terminated by `\n`.
pub struct CsvItemWriterBuilder {
    name: String,
    delimiter: u8,
    has_headers: bool,
}

impl Default for CsvItemWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvItemWriterBuilder {
    pub fn new() -> CsvItemWriterBuilder {
        CsvItemWriterBuilder {
            name: "csvItemWriter".to_string(),
            delimiter: b',',
            has_headers: false,
        }
    }

    /// Name used to key the writer state in the step context.
    pub fn name(mut self, name: &str) -> CsvItemWriterBuilder {
        self.name = name.to_string();
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> CsvItemWriterBuilder {
        self.delimiter = delimiter;
        self
    }

    /// Writes a header row, derived from the item's field names, before the first line.
    pub fn has_headers(mut self, yes: bool) -> CsvItemWriterBuilder {
        self.has_headers = yes;
        self
    }

    pub fn from_path<P: AsRef<Path>>(self, path: P) -> CsvItemWriter<File> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let opener: Opener<File> = Box::new(move |append| {
            debug!(
                "Opening {} ({})",
                path.display(),
                if append { "append" } else { "truncate" }
            );
            let mut options = OpenOptions::new();
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            options.create(true).open(&path).map_err(|error| {
                BatchError::ItemWriter(format!("cannot open {}: {}", path.display(), error))
            })
        });

        self.build(Some(opener), None)
    }

    /// Writes to an already open destination; `open` leaves it untouched.
    ///
    /// ```
    /// # use user_batch::item::csv::csv_writer::CsvItemWriterBuilder;
    /// # use user_batch::core::item::ItemWriter;
    /// # use user_batch::core::transaction::ChunkTransaction;
    /// #[derive(serde::Serialize)]
    /// struct Row<'a> {
    ///     id: u32,
    ///     name: &'a str,
    /// }
    ///
    /// let writer = CsvItemWriterBuilder::new().from_writer(vec![]);
    ///
    /// let mut transaction = ChunkTransaction::new(0);
    /// writer
    ///     .write(&[Row { id: 1, name: "Alice" }, Row { id: 2, name: "Bob" }], &mut transaction)
    ///     .unwrap();
    /// transaction.commit().unwrap();
    ///
    /// let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
    /// assert_eq!(data, "1,Alice\n2,Bob\n");
    /// ```
    pub fn from_writer<W: Write>(self, wtr: W) -> CsvItemWriter<W> {
        self.build(None, Some(wtr))
    }

    fn build<W: Write>(self, opener: Option<Opener<W>>, output: Option<W>) -> CsvItemWriter<W> {
        CsvItemWriter {
            name: self.name,
            delimiter: self.delimiter,
            has_headers: self.has_headers,
            opener,
            output: RefCell::new(output),
            header_written: Cell::new(false),
            written: Cell::new(0),
        }
    }
}

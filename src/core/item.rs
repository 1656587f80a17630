use crate::error::BatchError;

use super::{context::ExecutionContext, transaction::ChunkTransaction};

/// Represents the result of reading an item from the reader.
///
/// - `Ok(Some(item))` when an item was read
/// - `Ok(None)` at end of stream
/// - `Err(BatchError::ItemReader(_))` when the input is malformed or unreachable
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

/// Represents the result of processing an item by the processor.
pub type ItemProcessorResult<O> = Result<O, BatchError>;

/// Represents the result of writing items by the writer.
pub type ItemWriterResult = Result<(), BatchError>;

/// A lazy, finite source of records read one at a time.
///
/// A reader is opened once per step execution, read sequentially until it yields
/// `Ok(None)`, then closed. Readers that can resume store their position in the step's
/// [`ExecutionContext`] from [`ItemReader::update`], which the step calls after every
/// committed chunk, and seek back to it in [`ItemReader::open`].
pub trait ItemReader<I> {
    /// Prepares the reader for a step execution.
    ///
    /// `context` holds the state saved by a previous, failed execution of the same step
    /// when the job is being restarted, and is empty otherwise.
    fn open(&self, _context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    /// Reads the next item.
    fn read(&self) -> ItemReaderResult<I>;

    /// Saves the reader position once a chunk has been committed.
    fn update(&self, _context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Transforms a read item into the item handed to the writer.
pub trait ItemProcessor<I, O> {
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Accepts ordered chunks of items and persists them atomically.
///
/// [`ItemWriter::write`] receives the chunk's transaction handle. A writer must not make
/// anything durable inside `write` itself: it stages the chunk and enlists a
/// [`TransactionalResource`](super::transaction::TransactionalResource) that publishes
/// the staged work on commit and discards it on rollback.
pub trait ItemWriter<O> {
    fn open(&self, _context: &ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    /// Stages `items` inside `transaction`.
    ///
    /// # Errors
    ///
    /// Returns `BatchError::ItemWriter` when the chunk cannot be staged. The step then
    /// rolls `transaction` back, so whatever was already enlisted is discarded.
    fn write<'t>(&'t self, items: &[O], transaction: &mut ChunkTransaction<'t>)
    -> ItemWriterResult;

    /// Saves the writer position once a chunk has been committed.
    fn update(&self, _context: &mut ExecutionContext) -> Result<(), BatchError> {
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Identity processor used when a step has no processor configured.
#[derive(Default)]
pub struct PassThroughProcessor;

impl<I: Clone> ItemProcessor<I, I> for PassThroughProcessor {
    fn process(&self, item: &I) -> ItemProcessorResult<I> {
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_returns_an_equal_item() {
        let processor = PassThroughProcessor;
        let item = ("1".to_string(), 42);

        let processed = processor.process(&item).unwrap();

        assert_eq!(processed, item);
    }
}

use log::{debug, warn};

use crate::error::BatchError;

/// Work staged by a writer that becomes durable only when its chunk commits.
///
/// Dropping a resource without committing it must leave the sink untouched, so a chunk
/// whose transaction is never committed (an error, a panic) is rolled back implicitly.
pub trait TransactionalResource {
    /// Makes the staged work durable.
    fn commit(self: Box<Self>) -> Result<(), BatchError>;

    /// Discards the staged work.
    fn rollback(self: Box<Self>) -> Result<(), BatchError> {
        Ok(())
    }
}

/// Transaction handle scoped to exactly one chunk.
///
/// The step opens one per chunk write, passes it to
/// [`ItemWriter::write`](super::item::ItemWriter::write), then either commits or rolls
/// it back. Consuming `self` in both cases guarantees a handle is never reused for a
/// second chunk.
pub struct ChunkTransaction<'t> {
    chunk: usize,
    resources: Vec<Box<dyn TransactionalResource + 't>>,
}

impl<'t> ChunkTransaction<'t> {
    pub fn new(chunk: usize) -> Self {
        Self {
            chunk,
            resources: Vec::new(),
        }
    }

    /// Zero-based index of the chunk within its step execution.
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Registers staged work to be committed or rolled back with this chunk.
    pub fn enlist(&mut self, resource: impl TransactionalResource + 't) {
        self.resources.push(Box::new(resource));
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Commits every enlisted resource in enlistment order.
    ///
    /// If one fails, the resources not yet committed are rolled back and the error is
    /// returned.
    pub fn commit(self) -> Result<(), BatchError> {
        debug!("Committing chunk {}", self.chunk);
        let mut resources = self.resources.into_iter();

        while let Some(resource) = resources.next() {
            if let Err(error) = resource.commit() {
                for remaining in resources.by_ref() {
                    if let Err(rollback_error) = remaining.rollback() {
                        warn!("Rollback after failed commit failed: {}", rollback_error);
                    }
                }
                return Err(error);
            }
        }

        Ok(())
    }

    /// Rolls back every enlisted resource. All of them are attempted; the first error is
    /// reported.
    pub fn rollback(self) -> Result<(), BatchError> {
        debug!("Rolling back chunk {}", self.chunk);
        let mut first_error = None;

        for resource in self.resources {
            if let Err(error) = resource.rollback() {
                warn!("Error rolling back chunk {}: {}", self.chunk, error);
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::BatchError;

use super::{
    context::ExecutionContext,
    item::{ItemProcessor, ItemReader, ItemWriter, PassThroughProcessor},
    listener::{AfterStep, BeforeStep},
    skip::{LimitCheckingSkipPolicy, NeverSkipItemSkipPolicy, SkipPolicy},
    transaction::ChunkTransaction,
};

/// Status shared by step and job executions.
///
/// `Starting -> Started -> {Completed | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Created but not yet running.
    Starting,
    /// Running.
    Started,
    /// Finished without an unrecovered error.
    Completed,
    /// Finished with an unrecovered error.
    Failed,
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, PartialEq)]
enum ChunkStatus {
    /// The chunk is full and more items may follow.
    Full,
    /// The reader is exhausted; the chunk may be partial or empty.
    Finished,
}

/// Execution record of one step run.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Unique identifier for this step execution
    pub id: Uuid,
    /// Name of the executed step
    pub name: String,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items committed by the writer
    pub write_count: usize,
    pub read_skip_count: usize,
    pub process_skip_count: usize,
    pub write_skip_count: usize,
    /// Number of chunk transactions committed
    pub commit_count: usize,
    /// Number of chunk transactions rolled back
    pub rollback_count: usize,
    /// Step scoped state, holds reader and writer positions
    pub context: ExecutionContext,
    /// Error that failed the step, if any
    pub failure: Option<String>,
}

impl StepExecution {
    pub fn new(name: &str) -> Self {
        Self::with_context(name, ExecutionContext::new())
    }

    /// Creates an execution that resumes from the state saved by an earlier one.
    pub fn with_context(name: &str, context: ExecutionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: BatchStatus::Starting,
            start_time: None,
            end_time: None,
            read_count: 0,
            write_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            commit_count: 0,
            rollback_count: 0,
            context,
            failure: None,
        }
    }

    pub fn skip_count(&self) -> usize {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn start(&mut self) {
        self.status = BatchStatus::Started;
        self.start_time = Some(Utc::now());
    }

    fn finish(&mut self, result: &Result<(), BatchError>) {
        match result {
            Ok(()) => self.status = BatchStatus::Completed,
            Err(error) => {
                self.status = BatchStatus::Failed;
                self.failure = Some(error.to_string());
            }
        }
        self.end_time = Some(Utc::now());
    }
}

/// A stage of a job with its own lifecycle and execution record.
pub trait Step {
    fn get_name(&self) -> &str;

    /// Runs the step, recording progress and outcome in `step_execution`.
    ///
    /// `job_context` is the execution context of the enclosing job run.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the step. `step_execution.status` is `Failed` and
    /// `step_execution.failure` holds its message in that case.
    fn execute(
        &self,
        step_execution: &mut StepExecution,
        job_context: &mut ExecutionContext,
    ) -> Result<(), BatchError>;

    /// Whether the step runs again on restart even though it completed before.
    fn allow_start_if_complete(&self) -> bool {
        false
    }
}

/// A step driving the read, process, write loop one chunk at a time.
///
/// Each chunk is read entirely before anything is processed or written, then written in
/// its own [`ChunkTransaction`]. A chunk is either fully committed or fully rolled back.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    chunk_size: u16,
    retry_limit: u16,
    skip_policy: Box<dyn SkipPolicy + 'a>,
    before_listeners: Vec<&'a dyn BeforeStep>,
    after_listeners: Vec<&'a dyn AfterStep>,
    promoted_keys: Vec<String>,
    allow_start_if_complete: bool,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        step_execution: &mut StepExecution,
        job_context: &mut ExecutionContext,
    ) -> Result<(), BatchError> {
        step_execution.start();

        info!(
            "Start of step: {}, id: {}",
            step_execution.name, step_execution.id
        );

        for listener in &self.before_listeners {
            listener.before_step(step_execution);
        }

        let mut result = self.open(step_execution);
        if result.is_ok() {
            result = self.run_chunks(step_execution);
        }

        let close_result = self.close();
        if result.is_ok() {
            result = close_result;
        }

        if result.is_ok() {
            self.promote(step_execution, job_context);
        }

        let result = result.map_err(|error| {
            error!("Step {} failed: {}", self.name, error);
            BatchError::Step {
                name: self.name.clone(),
                detail: error.to_string(),
            }
        });
        step_execution.finish(&result);

        for listener in &self.after_listeners {
            listener.after_step(step_execution);
        }

        info!(
            "End of step: {}, id: {}, status: {:?}",
            step_execution.name, step_execution.id, step_execution.status
        );

        result
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn open(&self, step_execution: &StepExecution) -> Result<(), BatchError> {
        self.reader.open(&step_execution.context)?;
        self.writer.open(&step_execution.context)
    }

    fn close(&self) -> Result<(), BatchError> {
        let reader_result = self.reader.close();
        let writer_result = self.writer.close();

        if let Err(error) = &reader_result {
            warn!("Error closing reader of step {}: {}", self.name, error);
        }
        if let Err(error) = &writer_result {
            warn!("Error closing writer of step {}: {}", self.name, error);
        }

        reader_result.and(writer_result)
    }

    fn run_chunks(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let mut chunk = 0;

        loop {
            let (read_items, chunk_status) = self.read_chunk(step_execution)?;

            if read_items.is_empty() && chunk_status == ChunkStatus::Finished {
                debug!("No more items to read");
                return Ok(());
            }

            let processed_items = self.process_chunk(step_execution, &read_items)?;
            self.write_chunk(step_execution, chunk, &processed_items)?;
            chunk += 1;

            if chunk_status == ChunkStatus::Finished {
                return Ok(());
            }
        }
    }

    /// Reads up to `chunk_size` items. A partial chunk is returned at end of stream.
    fn read_chunk(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(Vec<I>, ChunkStatus), BatchError> {
        debug!("Start reading chunk");

        let mut read_items = Vec::with_capacity(self.chunk_size as usize);

        loop {
            match self.reader.read() {
                Ok(Some(item)) => {
                    read_items.push(item);
                    step_execution.read_count += 1;

                    if read_items.len() >= self.chunk_size as usize {
                        return Ok((read_items, ChunkStatus::Full));
                    }
                }
                Ok(None) => return Ok((read_items, ChunkStatus::Finished)),
                Err(error) => {
                    if !self
                        .skip_policy
                        .should_skip(&error, step_execution.skip_count())
                    {
                        return Err(error);
                    }
                    warn!("Skipping item after read error: {}", error);
                    step_execution.read_skip_count += 1;
                }
            }
        }
    }

    fn process_chunk(
        &self,
        step_execution: &mut StepExecution,
        read_items: &[I],
    ) -> Result<Vec<O>, BatchError> {
        debug!("Processing chunk of {} items", read_items.len());

        let mut processed_items = Vec::with_capacity(read_items.len());

        for item in read_items {
            match self.processor.process(item) {
                Ok(processed_item) => processed_items.push(processed_item),
                Err(error) => {
                    if !self
                        .skip_policy
                        .should_skip(&error, step_execution.skip_count())
                    {
                        return Err(error);
                    }
                    warn!("Skipping item after process error: {}", error);
                    step_execution.process_skip_count += 1;
                }
            }
        }

        Ok(processed_items)
    }

    /// Writes one chunk, retrying and then falling back to item by item writes when the
    /// skip policy allows it. Stream positions are saved only once the chunk's items are
    /// committed or skipped.
    fn write_chunk(
        &self,
        step_execution: &mut StepExecution,
        chunk: usize,
        items: &[O],
    ) -> Result<(), BatchError> {
        debug!("Writing chunk {} of {} items", chunk, items.len());

        if items.is_empty() {
            debug!("No items to write, skipping write call");
            return self.update_streams(step_execution);
        }

        let mut attempt: u16 = 0;

        loop {
            match self.write_in_transaction(chunk, items) {
                Ok(()) => {
                    step_execution.write_count += items.len();
                    step_execution.commit_count += 1;
                    return self.update_streams(step_execution);
                }
                Err(error) => {
                    step_execution.rollback_count += 1;
                    warn!("Chunk {} rolled back: {}", chunk, error);

                    if attempt < self.retry_limit {
                        attempt += 1;
                        info!("Retrying chunk {} (attempt {})", chunk, attempt);
                        continue;
                    }

                    if !self
                        .skip_policy
                        .should_skip(&error, step_execution.skip_count())
                    {
                        return Err(error);
                    }

                    return self.scan_chunk(step_execution, chunk, items);
                }
            }
        }
    }

    /// Re-writes a rolled back chunk one item per transaction, skipping only the items
    /// that fail on their own.
    fn scan_chunk(
        &self,
        step_execution: &mut StepExecution,
        chunk: usize,
        items: &[O],
    ) -> Result<(), BatchError> {
        info!("Scanning chunk {} item by item", chunk);

        for item in items {
            match self.write_in_transaction(chunk, std::slice::from_ref(item)) {
                Ok(()) => {
                    step_execution.write_count += 1;
                    step_execution.commit_count += 1;
                }
                Err(error) => {
                    step_execution.rollback_count += 1;
                    if !self
                        .skip_policy
                        .should_skip(&error, step_execution.skip_count())
                    {
                        return Err(error);
                    }
                    warn!("Skipping item after write error: {}", error);
                    step_execution.write_skip_count += 1;
                }
            }
        }

        self.update_streams(step_execution)
    }

    fn write_in_transaction(&self, chunk: usize, items: &[O]) -> Result<(), BatchError> {
        let mut transaction = ChunkTransaction::new(chunk);

        match self.writer.write(items, &mut transaction) {
            Ok(()) => transaction.commit(),
            Err(error) => {
                if let Err(rollback_error) = transaction.rollback() {
                    warn!("Error rolling back chunk {}: {}", chunk, rollback_error);
                }
                Err(error)
            }
        }
    }

    fn update_streams(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        self.reader.update(&mut step_execution.context)?;
        self.writer.update(&mut step_execution.context)
    }

    fn promote(&self, step_execution: &StepExecution, job_context: &mut ExecutionContext) {
        for key in &self.promoted_keys {
            if let Some(value) = step_execution.context.get(key) {
                job_context.put(key.clone(), value.clone());
            }
        }
    }
}

/// Builder for a [`ChunkOrientedStep`].
///
/// A reader and a writer are required. Without a processor, items are passed through
/// unchanged, which requires the read and written item types to be the same.
///
/// # Example
///
/// ```
/// use user_batch::core::item::{ItemReader, ItemReaderResult};
/// use user_batch::core::step::{BatchStatus, ChunkOrientedStep, Step, StepBuilder, StepExecution};
/// use user_batch::core::context::ExecutionContext;
/// # use user_batch::core::item::{ItemWriter, ItemWriterResult};
/// # use user_batch::core::transaction::ChunkTransaction;
/// # use std::cell::Cell;
/// # struct Counter(Cell<u32>);
/// # impl ItemReader<u32> for Counter {
/// #     fn read(&self) -> ItemReaderResult<u32> {
/// #         let next = self.0.get();
/// #         self.0.set(next + 1);
/// #         Ok((next < 12).then_some(next))
/// #     }
/// # }
/// # struct Sink;
/// # impl ItemWriter<u32> for Sink {
/// #     fn write<'t>(&'t self, _: &[u32], _: &mut ChunkTransaction<'t>) -> ItemWriterResult {
/// #         Ok(())
/// #     }
/// # }
/// let reader = Counter(Cell::new(0));
/// let writer = Sink;
///
/// let step: ChunkOrientedStep<u32, u32> = StepBuilder::new("count")
///     .reader(&reader)
///     .writer(&writer)
///     .chunk(5)
///     .build()
///     .unwrap();
///
/// let mut execution = StepExecution::new(step.get_name());
/// step.execute(&mut execution, &mut ExecutionContext::new()).unwrap();
///
/// assert_eq!(execution.status, BatchStatus::Completed);
/// assert_eq!(execution.read_count, 12);
/// assert_eq!(execution.commit_count, 3);
/// ```
pub struct StepBuilder<'a, I, O> {
    name: String,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    chunk_size: u16,
    retry_limit: u16,
    skip_policy: Option<Box<dyn SkipPolicy + 'a>>,
    before_listeners: Vec<&'a dyn BeforeStep>,
    after_listeners: Vec<&'a dyn AfterStep>,
    promoted_keys: Vec<String>,
    allow_start_if_complete: bool,
}

impl<'a, I, O> StepBuilder<'a, I, O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reader: None,
            processor: None,
            writer: None,
            chunk_size: 10,
            retry_limit: 0,
            skip_policy: None,
            before_listeners: Vec::new(),
            after_listeners: Vec::new(),
            promoted_keys: Vec::new(),
            allow_start_if_complete: false,
        }
    }

    pub fn reader(mut self, reader: &'a dyn ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a dyn ItemProcessor<I, O>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a dyn ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Sets the commit interval.
    pub fn chunk(mut self, chunk_size: u16) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Skips up to `skip_limit` failed items in total before failing the step.
    pub fn skip_limit(mut self, skip_limit: u16) -> Self {
        self.skip_policy = Some(Box::new(LimitCheckingSkipPolicy::new(skip_limit.into())));
        self
    }

    pub fn skip_policy(mut self, skip_policy: impl SkipPolicy + 'a) -> Self {
        self.skip_policy = Some(Box::new(skip_policy));
        self
    }

    /// Number of times a failed chunk write is retried before the skip policy applies.
    pub fn retry_limit(mut self, retry_limit: u16) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn before_step(mut self, listener: &'a dyn BeforeStep) -> Self {
        self.before_listeners.push(listener);
        self
    }

    pub fn after_step(mut self, listener: &'a dyn AfterStep) -> Self {
        self.after_listeners.push(listener);
        self
    }

    /// Registers a listener implementing both step hooks.
    pub fn listener<L: BeforeStep + AfterStep>(self, listener: &'a L) -> Self {
        self.before_step(listener).after_step(listener)
    }

    /// Copies `key` from the step context into the job context when the step completes.
    pub fn promote(mut self, key: &str) -> Self {
        self.promoted_keys.push(key.to_string());
        self
    }

    pub fn allow_start_if_complete(mut self, yes: bool) -> Self {
        self.allow_start_if_complete = yes;
        self
    }

    /// Builds the step.
    ///
    /// # Errors
    ///
    /// `BatchError::Configuration` when the reader or writer is missing, the chunk size
    /// is zero, or no processor is set and the item types differ.
    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError>
    where
        PassThroughProcessor: ItemProcessor<I, O>,
    {
        let processor: &'a dyn ItemProcessor<I, O> = match self.processor {
            Some(processor) => processor,
            None => &PassThroughProcessor,
        };
        self.build_with(processor)
    }

    /// Builds a step whose processor is mandatory, for distinct item types.
    pub fn build_with_processor(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let processor = self.processor.ok_or_else(|| {
            BatchError::Configuration(format!("step {}: no processor configured", self.name))
        })?;
        self.build_with(processor)
    }

    fn build_with(
        self,
        processor: &'a dyn ItemProcessor<I, O>,
    ) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let reader = self.reader.ok_or_else(|| {
            BatchError::Configuration(format!("step {}: no reader configured", self.name))
        })?;
        let writer = self.writer.ok_or_else(|| {
            BatchError::Configuration(format!("step {}: no writer configured", self.name))
        })?;
        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(format!(
                "step {}: chunk size must be greater than zero",
                self.name
            )));
        }

        Ok(ChunkOrientedStep {
            name: self.name,
            reader,
            processor,
            writer,
            chunk_size: self.chunk_size,
            retry_limit: self.retry_limit,
            skip_policy: self
                .skip_policy
                .unwrap_or_else(|| Box::new(NeverSkipItemSkipPolicy)),
            before_listeners: self.before_listeners,
            after_listeners: self.after_listeners,
            promoted_keys: self.promoted_keys,
            allow_start_if_complete: self.allow_start_if_complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::core::{item::ItemWriterResult, transaction::TransactionalResource};

    /// Yields the given results in order, then end of stream.
    struct ScriptedReader {
        items: RefCell<Vec<Result<u32, BatchError>>>,
        position: Cell<u64>,
    }

    impl ScriptedReader {
        fn new(mut items: Vec<Result<u32, BatchError>>) -> Self {
            items.reverse();
            Self {
                items: RefCell::new(items),
                position: Cell::new(0),
            }
        }

        fn ok(count: u32) -> Self {
            Self::new((1..=count).map(Ok).collect())
        }
    }

    impl ItemReader<u32> for ScriptedReader {
        fn read(&self) -> Result<Option<u32>, BatchError> {
            match self.items.borrow_mut().pop() {
                Some(result) => {
                    self.position.set(self.position.get() + 1);
                    result.map(Some)
                }
                None => Ok(None),
            }
        }

        fn update(&self, context: &mut ExecutionContext) -> Result<(), BatchError> {
            context.put("scripted.read.count", self.position.get());
            Ok(())
        }
    }

    struct StagedItems<'t> {
        items: Vec<u32>,
        committed: &'t RefCell<Vec<u32>>,
    }

    impl TransactionalResource for StagedItems<'_> {
        fn commit(self: Box<Self>) -> Result<(), BatchError> {
            self.committed.borrow_mut().extend(self.items);
            Ok(())
        }
    }

    /// Refuses any chunk containing one of `rejected`, and optionally the first
    /// `failures` writes whatever they contain.
    #[derive(Default)]
    struct RecordingWriter {
        committed: RefCell<Vec<u32>>,
        rejected: Vec<u32>,
        failures: Cell<u16>,
        calls: Cell<usize>,
    }

    impl ItemWriter<u32> for RecordingWriter {
        fn write<'t>(
            &'t self,
            items: &[u32],
            transaction: &mut ChunkTransaction<'t>,
        ) -> ItemWriterResult {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(BatchError::ItemWriter("transient".to_string()));
            }
            if let Some(item) = items.iter().find(|item| self.rejected.contains(item)) {
                return Err(BatchError::ItemWriter(format!("duplicate key {item}")));
            }
            transaction.enlist(StagedItems {
                items: items.to_vec(),
                committed: &self.committed,
            });
            Ok(())
        }
    }

    struct Doubler;

    impl ItemProcessor<u32, u64> for Doubler {
        fn process(&self, item: &u32) -> Result<u64, BatchError> {
            if *item == 13 {
                return Err(BatchError::ItemProcessor("unlucky".to_string()));
            }
            Ok(u64::from(*item) * 2)
        }
    }

    #[derive(Default)]
    struct HookRecorder {
        calls: RefCell<Vec<String>>,
    }

    impl BeforeStep for HookRecorder {
        fn before_step(&self, step_execution: &StepExecution) {
            self.calls
                .borrow_mut()
                .push(format!("before {:?}", step_execution.status));
        }
    }

    impl AfterStep for HookRecorder {
        fn after_step(&self, step_execution: &StepExecution) {
            self.calls
                .borrow_mut()
                .push(format!("after {:?}", step_execution.status));
        }
    }

    fn run(step: &dyn Step) -> (StepExecution, Result<(), BatchError>) {
        let mut execution = StepExecution::new(step.get_name());
        let result = step.execute(&mut execution, &mut ExecutionContext::new());
        (execution, result)
    }

    #[test]
    fn should_write_every_item_in_bounded_chunks() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(12);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("copy")
            .reader(&reader)
            .writer(&writer)
            .chunk(5)
            .build()?;

        let (execution, result) = run(&step);

        assert!(result.is_ok());
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.read_count, 12);
        assert_eq!(execution.write_count, 12);
        assert_eq!(execution.commit_count, 3);
        assert_eq!(execution.rollback_count, 0);
        assert_eq!(writer.calls.get(), 3);
        assert_eq!(*writer.committed.borrow(), (1..=12).collect::<Vec<_>>());
        assert_eq!(execution.context.get_u64("scripted.read.count"), Some(12));
        assert!(execution.start_time.is_some());
        assert!(execution.end_time >= execution.start_time);
        Ok(())
    }

    #[test]
    fn should_complete_on_empty_input_without_writing() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(0);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("empty")
            .reader(&reader)
            .writer(&writer)
            .chunk(5)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(writer.calls.get(), 0);
        assert_eq!(execution.commit_count, 0);
        Ok(())
    }

    #[test]
    fn should_not_write_an_extra_empty_chunk_on_exact_multiple() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(10);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("exact")
            .reader(&reader)
            .writer(&writer)
            .chunk(5)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.write_count, 10);
        assert_eq!(writer.calls.get(), 2);
        Ok(())
    }

    #[test]
    fn failed_write_rolls_back_the_chunk_and_fails_the_step() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(12);
        let writer = RecordingWriter {
            rejected: vec![7],
            ..Default::default()
        };
        let step = StepBuilder::<u32, u32>::new("import")
            .reader(&reader)
            .writer(&writer)
            .chunk(5)
            .build()?;

        let (execution, result) = run(&step);

        assert!(matches!(result, Err(BatchError::Step { .. })));
        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(execution.failure.as_deref().unwrap().contains("duplicate key 7"));
        // first chunk committed, second rolled back, third never read
        assert_eq!(*writer.committed.borrow(), vec![1, 2, 3, 4, 5]);
        assert_eq!(execution.read_count, 10);
        assert_eq!(execution.write_count, 5);
        assert_eq!(execution.rollback_count, 1);
        assert_eq!(execution.context.get_u64("scripted.read.count"), Some(5));
        Ok(())
    }

    #[test]
    fn read_error_aborts_the_current_chunk() -> Result<(), BatchError> {
        let reader = ScriptedReader::new(vec![
            Ok(1),
            Ok(2),
            Err(BatchError::ItemReader("missing column".to_string())),
            Ok(4),
        ]);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("read")
            .reader(&reader)
            .writer(&writer)
            .chunk(5)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(writer.calls.get(), 0);
        assert!(writer.committed.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn read_errors_within_the_skip_limit_are_counted() -> Result<(), BatchError> {
        let reader = ScriptedReader::new(vec![
            Ok(1),
            Err(BatchError::ItemReader("bad row".to_string())),
            Ok(3),
        ]);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("tolerant")
            .reader(&reader)
            .writer(&writer)
            .skip_limit(1)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.read_skip_count, 1);
        assert_eq!(*writer.committed.borrow(), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn skippable_write_failure_is_isolated_to_the_failing_item() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(8);
        let writer = RecordingWriter {
            rejected: vec![3],
            ..Default::default()
        };
        let step = StepBuilder::<u32, u32>::new("scan")
            .reader(&reader)
            .writer(&writer)
            .chunk(4)
            .skip_limit(1)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(*writer.committed.borrow(), vec![1, 2, 4, 5, 6, 7, 8]);
        assert_eq!(execution.write_skip_count, 1);
        assert_eq!(
            execution.write_count,
            execution.read_count - execution.skip_count()
        );
        // rolled back chunk + the single failing item
        assert_eq!(execution.rollback_count, 2);
        Ok(())
    }

    #[test]
    fn exceeding_the_skip_limit_fails_the_step() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(6);
        let writer = RecordingWriter {
            rejected: vec![2, 3],
            ..Default::default()
        };
        let step = StepBuilder::<u32, u32>::new("strict")
            .reader(&reader)
            .writer(&writer)
            .chunk(6)
            .skip_limit(1)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.write_skip_count, 1);
        assert_eq!(*writer.committed.borrow(), vec![1]);
        Ok(())
    }

    #[test]
    fn transient_write_failure_succeeds_on_retry() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(3);
        let writer = RecordingWriter {
            failures: Cell::new(2),
            ..Default::default()
        };
        let step = StepBuilder::<u32, u32>::new("retry")
            .reader(&reader)
            .writer(&writer)
            .retry_limit(2)
            .build()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.rollback_count, 2);
        assert_eq!(writer.calls.get(), 3);
        assert_eq!(*writer.committed.borrow(), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn processor_transforms_items_and_its_errors_are_skippable() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(14);
        let processor = Doubler;
        let committed = RefCell::new(Vec::new());

        struct U64Writer<'c>(&'c RefCell<Vec<u64>>);
        impl ItemWriter<u64> for U64Writer<'_> {
            fn write<'t>(
                &'t self,
                items: &[u64],
                _: &mut ChunkTransaction<'t>,
            ) -> ItemWriterResult {
                self.0.borrow_mut().extend_from_slice(items);
                Ok(())
            }
        }
        let writer = U64Writer(&committed);

        let step = StepBuilder::<u32, u64>::new("double")
            .reader(&reader)
            .processor(&processor)
            .writer(&writer)
            .skip_limit(1)
            .build_with_processor()?;

        let (execution, _) = run(&step);

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.process_skip_count, 1);
        assert_eq!(committed.borrow().len(), 13);
        assert_eq!(committed.borrow()[0], 2);
        Ok(())
    }

    #[test]
    fn hooks_run_once_even_when_the_step_fails() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(2);
        let writer = RecordingWriter {
            rejected: vec![1],
            ..Default::default()
        };
        let hooks = HookRecorder::default();
        let step = StepBuilder::<u32, u32>::new("hooks")
            .reader(&reader)
            .writer(&writer)
            .listener(&hooks)
            .build()?;

        let _ = run(&step);

        assert_eq!(*hooks.calls.borrow(), vec!["before Started", "after Failed"]);
        Ok(())
    }

    #[test]
    fn completed_step_promotes_keys_to_the_job_context() -> Result<(), BatchError> {
        let reader = ScriptedReader::ok(4);
        let writer = RecordingWriter::default();
        let step = StepBuilder::<u32, u32>::new("promote")
            .reader(&reader)
            .writer(&writer)
            .promote("scripted.read.count")
            .build()?;
        let mut execution = StepExecution::new(step.get_name());
        let mut job_context = ExecutionContext::new();

        step.execute(&mut execution, &mut job_context)?;

        assert_eq!(job_context.get_u64("scripted.read.count"), Some(4));
        Ok(())
    }

    #[test]
    fn missing_wiring_is_a_configuration_error() {
        let writer = RecordingWriter::default();
        let reader = ScriptedReader::ok(1);

        let no_reader = StepBuilder::<u32, u32>::new("a").writer(&writer).build();
        let no_writer = StepBuilder::<u32, u32>::new("b").reader(&reader).build();
        let zero_chunk = StepBuilder::<u32, u32>::new("c")
            .reader(&reader)
            .writer(&writer)
            .chunk(0)
            .build();

        assert!(matches!(no_reader, Err(BatchError::Configuration(_))));
        assert!(matches!(no_writer, Err(BatchError::Configuration(_))));
        assert!(matches!(zero_chunk, Err(BatchError::Configuration(_))));
    }
}

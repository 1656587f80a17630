/// CSV support for reading and writing delimited records.
///
/// - [`csv_reader::CsvItemReader`] streams rows and deserializes them positionally with
///   serde. It can skip a header row and resume from a saved position.
/// - [`csv_writer::CsvItemWriter`] serializes each chunk in memory and writes it to its
///   destination when the chunk commits. On a fresh run it truncates its file; on a
///   restart it appends after the lines already committed.
///
/// # Example
///
/// ```
/// use user_batch::item::csv::csv_reader::CsvItemReaderBuilder;
/// use user_batch::item::csv::csv_writer::CsvItemWriterBuilder;
/// use user_batch::core::context::ExecutionContext;
/// use user_batch::core::step::{BatchStatus, Step, StepBuilder, StepExecution};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Deserialize, Serialize)]
/// struct City {
///     city: String,
///     country: String,
///     pop: u32,
/// }
///
/// let csv_data = "\
/// city,country,pop
/// Boston,United States,4628910
/// Concord,United States,42695
/// ";
///
/// let reader = CsvItemReaderBuilder::new()
///     .has_headers(true)
///     .from_reader(csv_data.as_bytes());
/// let writer = CsvItemWriterBuilder::new()
///     .delimiter(b';')
///     .from_writer(Vec::new());
///
/// let step = StepBuilder::<City, City>::new("cities")
///     .reader(&reader)
///     .writer(&writer)
///     .build()
///     .unwrap();
/// let mut execution = StepExecution::new("cities");
/// step.execute(&mut execution, &mut ExecutionContext::new()).unwrap();
/// drop(step);
///
/// assert_eq!(execution.status, BatchStatus::Completed);
/// let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
/// assert_eq!(
///     output,
///     "Boston;United States;4628910\nConcord;United States;42695\n"
/// );
/// ```
pub mod csv_reader;

pub mod csv_writer;

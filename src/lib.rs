#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
 # User Batch

 A small chunk-oriented batch engine, and the job it was built for: import users from a
 CSV file into SQLite, then export the table to a flat file.

 ## Core Concepts

 - **Job:** an ordered sequence of `Step`s sharing one execution context. It stops at the
   first failed step.
 - **Step:** reads items in chunks, processes them and writes each chunk in its own
   transaction. It records its status and item counts in a `StepExecution`.
 - **ItemReader:** produces the input of a `Step`, one item at a time.
 - **ItemProcessor:** transforms a read item into the item to write.
 - **ItemWriter:** stages a chunk of items inside the chunk's `ChunkTransaction`; nothing
   is durable before the transaction commits.
 - **JobLauncher:** runs a job with a set of `JobParameters` and refuses to run the same
   parameters twice.

 ## Features

 | **Feature**   | **Description**                                               |
 |---------------|---------------------------------------------------------------|
 | csv           | Enables CSV `ItemReader` and `ItemWriter`                     |
 | rdbc-sqlite   | Enables RDBC `ItemReader` and `ItemWriter` for SQLite         |
 | full          | Enables all available features                                |

 Both are enabled by default; the `users` job needs them.

 ## Getting Started

 ```rust
 # use serde::{Deserialize, Serialize};
 # use user_batch::{
 #     core::{
 #         item::{ItemProcessor, ItemProcessorResult},
 #         job::JobBuilder,
 #         launcher::{JobLauncher, JobParametersBuilder},
 #         step::{BatchStatus, StepBuilder},
 #     },
 #     error::BatchError,
 #     item::csv::{csv_reader::CsvItemReaderBuilder, csv_writer::CsvItemWriterBuilder},
 # };
 # use std::env::temp_dir;
 #[derive(Deserialize, Serialize, Debug, Clone)]
 struct Car {
     year: u16,
     make: String,
     model: String,
 }

 struct UpperCaseProcessor;

 impl ItemProcessor<Car, Car> for UpperCaseProcessor {
     fn process(&self, item: &Car) -> ItemProcessorResult<Car> {
         Ok(Car {
             year: item.year,
             make: item.make.to_uppercase(),
             model: item.model.to_uppercase(),
         })
     }
 }

 fn main() -> Result<(), BatchError> {
     let csv = "year,make,model
1948,Porsche,356
1995,Peugeot,205
2021,Mazda,CX-30";

     let reader = CsvItemReaderBuilder::new()
         .has_headers(true)
         .from_reader(csv.as_bytes());
     let processor = UpperCaseProcessor;
     let writer = CsvItemWriterBuilder::new().from_path(temp_dir().join("cars.csv"));

     let step = StepBuilder::<Car, Car>::new("uppercase")
         .reader(&reader)
         .processor(&processor)
         .writer(&writer)
         .chunk(2)
         .build_with_processor()?;

     let job = JobBuilder::new().name("cars").start(&step).build()?;

     let parameters = JobParametersBuilder::new()
         .add_current_time()
         .to_job_parameters();
     let execution = JobLauncher::default().run(&job, parameters)?;

     assert_eq!(execution.status, BatchStatus::Completed);
     assert_eq!(execution.step_executions[0].write_count, 3);
     Ok(())
 }
 ```
 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Item readers and writers (CSV files, SQLite tables)
pub mod item;

#[cfg(all(feature = "csv", feature = "rdbc-sqlite"))]
pub mod users;

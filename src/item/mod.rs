#[cfg(feature = "csv")]
/// CSV item reader and writer.
pub mod csv;

#[cfg(feature = "rdbc")]
/// RDBC (SQLite) item reader and writer.
pub mod rdbc;

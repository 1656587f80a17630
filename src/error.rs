use thiserror::Error;

#[derive(Error, Debug)]
/// Batch error
pub enum BatchError {
    /// A record source could not produce the next item (malformed or unreachable input).
    #[error("ItemReader from: {0}")]
    ItemReader(String),

    #[error("ItemProcessor from: {0}")]
    ItemProcessor(String),

    /// A record sink could not persist a chunk.
    #[error("ItemWriter from: {0}")]
    ItemWriter(String),

    /// A job could not be launched with the given parameters.
    #[error("Launch: {0}")]
    Launch(String),

    /// Required wiring is missing or invalid.
    #[error("Configuration: {0}")]
    Configuration(String),

    #[error("Step {name} failed: {detail}")]
    Step { name: String, detail: String },
}

impl BatchError {
    /// Errors raised while reading, processing or writing an item. Only these are
    /// candidates for a skip policy.
    pub fn is_item_error(&self) -> bool {
        matches!(
            self,
            BatchError::ItemReader(_) | BatchError::ItemProcessor(_) | BatchError::ItemWriter(_)
        )
    }
}

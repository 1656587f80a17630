use crate::error::BatchError;

/// Decides whether a failed item is counted and bypassed or aborts the step.
pub trait SkipPolicy {
    /// `skip_count` is the number of items already skipped in the current step execution.
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool;
}

/// Fail-fast policy: nothing is ever skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSkipItemSkipPolicy;

impl SkipPolicy for NeverSkipItemSkipPolicy {
    fn should_skip(&self, _error: &BatchError, _skip_count: usize) -> bool {
        false
    }
}

/// Skips item errors until `skip_limit` items have been skipped in the step.
#[derive(Debug, Clone, Copy)]
pub struct LimitCheckingSkipPolicy {
    skip_limit: usize,
}

impl LimitCheckingSkipPolicy {
    pub fn new(skip_limit: usize) -> Self {
        Self { skip_limit }
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn should_skip(&self, error: &BatchError, skip_count: usize) -> bool {
        error.is_item_error() && skip_count < self.skip_limit
    }
}

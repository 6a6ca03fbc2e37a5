//! Operation configuration.

/// What to do when an UPDATE without a version guard matches no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroRowsPolicy {
    /// Fail the operation with a not-found query error.
    #[default]
    Error,
    /// Log a warning and treat the instance as saved.
    Ignore,
}

/// Configuration for one save or delete operation.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// Maximum rows per multi-row INSERT and per `IN (...)` list.
    pub batch_size: usize,
    /// Whether inserts of one entity type may share a statement.
    pub multi_row_insert: bool,
    /// Policy for version-less updates that match no row.
    pub zero_rows: ZeroRowsPolicy,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            multi_row_insert: true,
            zero_rows: ZeroRowsPolicy::Error,
        }
    }
}

impl OperationConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size (builder pattern). Zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_multi_row_insert(mut self, value: bool) -> Self {
        self.multi_row_insert = value;
        self
    }

    #[must_use]
    pub fn with_zero_rows(mut self, policy: ZeroRowsPolicy) -> Self {
        self.zero_rows = policy;
        self
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

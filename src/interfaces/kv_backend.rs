//! Key-value backend interface and storage errors.

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::item::{AttrValue, Item, Key};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Optimistic lock failure: kifu_id={kifu_id}")]
    OptimisticLock { kifu_id: String },

    #[error("Invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Only transient backend failures may be retried with backoff.
    ///
    /// - `OptimisticLock`: the caller must reload and resubmit.
    /// - `NotFound`, `InvalidArgument`, `InvalidStoredValue`: retrying cannot change the outcome.
    /// - `Cancelled`: the caller gave up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

/// Precondition for a conditional put or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// No item exists under the key.
    NotExists,
    /// An item exists and `attr` equals `value`.
    Equals { attr: String, value: AttrValue },
    /// No item exists, or `attr` equals `value`.
    NotExistsOrEquals { attr: String, value: AttrValue },
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional {
    /// The write was applied. Carries the item it replaced or removed.
    Applied { previous: Option<Item> },
    /// The condition did not hold. Carries the item as it currently is.
    Rejected { current: Option<Item> },
}

/// One request inside a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    Delete(Key),
}

/// Sort-key condition of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeCondition {
    /// `lo <= attr <= hi`, lexicographic.
    Between { attr: String, lo: String, hi: String },
}

/// A single-page query against the table or one of its indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Secondary index name; `None` queries the table itself.
    pub index: Option<String>,
    pub partition_attr: String,
    pub partition_value: String,
    pub range: Option<RangeCondition>,
    pub ascending: bool,
    pub limit: Option<u32>,
    /// Continuation key from the previous page.
    pub start_key: Option<Item>,
}

impl QueryRequest {
    /// Query a partition of the table.
    pub fn partition(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index: None,
            partition_attr: attr.into(),
            partition_value: value.into(),
            range: None,
            ascending: true,
            limit: None,
            start_key: None,
        }
    }

    /// Query a partition of a secondary index.
    pub fn index(
        index: impl Into<String>,
        attr: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            index: Some(index.into()),
            ..Self::partition(attr, value)
        }
    }

    pub fn with_range(mut self, range: RangeCondition) -> Self {
        self.range = Some(range);
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Present when more pages follow.
    pub last_key: Option<Item>,
}

/// Maximum number of requests the backend accepts in one batch write.
pub const MAX_BATCH_WRITE: usize = 25;

/// Interface to the partitioned key-value store.
///
/// Implementations:
/// - `DynamoBackend`: Amazon DynamoDB
/// - `MemoryBackend`: in-process store for tests and local runs
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Point read. `Ok(None)` when nothing is stored under the key.
    async fn get(&self, key: &Key) -> Result<Option<Item>>;

    /// Put `item` if `condition` holds against the currently stored item.
    async fn put_if(&self, item: Item, condition: Condition) -> Result<Conditional>;

    /// Delete `key` if `condition` holds against the currently stored item.
    async fn delete_if(&self, key: &Key, condition: Condition) -> Result<Conditional>;

    /// Apply up to `MAX_BATCH_WRITE` unconditional puts and deletes.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()>;

    /// Fetch one page of a query.
    async fn query(&self, request: &QueryRequest) -> Result<QueryPage>;
}

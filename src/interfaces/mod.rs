//! Interfaces consumed by the storage core.

mod kv_backend;

pub use kv_backend::{
    Condition, Conditional, KvBackend, QueryPage, QueryRequest, RangeCondition, Result,
    StorageError, WriteRequest, MAX_BATCH_WRITE,
};

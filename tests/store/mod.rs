//! Shared kifu store integration tests.
//!
//! Tests the KifuStore operations against any KvBackend. Each backend driver
//! imports these test functions and runs them.

pub mod kifu_store_tests;

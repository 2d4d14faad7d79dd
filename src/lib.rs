//! Kansousen - kifu storage core
//!
//! Persists shogi game records (a root per game plus one step per move) in a
//! partitioned key-value store, with owner, recency and board-position lookups.

pub mod config;
pub mod interfaces;
pub mod kifu;
pub mod service;
pub mod storage;
pub mod utils;

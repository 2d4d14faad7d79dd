//! Kifu store: write, read and position-search orchestration over a
//! [`KvBackend`].
//!
//! Every operation takes the caller's `CancellationToken` as its execution
//! context. Fan-outs run through one [`WorkerPool`] sized by
//! [`StoreConfig::parallelism`]. Nothing is retried here; backend errors are
//! returned as they come.

mod read;
mod same_position;
mod write;

use std::sync::Arc;

use tracing::debug;

use crate::config::StoreConfig;
use crate::interfaces::{KvBackend, QueryRequest, Result};
use crate::storage::item::Item;
use crate::storage::pipeline::{Feeder, WorkerPool};

/// Storage orchestrator for kifu roots and steps.
pub struct KifuStore {
    backend: Arc<dyn KvBackend>,
    pool: WorkerPool,
    batch_write_size: usize,
    default_num_step: u32,
}

impl KifuStore {
    /// Fails with `InvalidArgument` when `config` does not validate.
    pub fn new(backend: Arc<dyn KvBackend>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            pool: WorkerPool::new(config.parallelism),
            batch_write_size: config.batch_write_size,
            default_num_step: config.default_num_step,
        })
    }

    pub fn parallelism(&self) -> usize {
        self.pool.parallelism()
    }
}

/// Producer that admits every page of `request` into the pipeline.
async fn feed_pages(
    backend: &dyn KvBackend,
    mut request: QueryRequest,
    mut feeder: Feeder<Vec<Item>>,
) -> Result<()> {
    let mut pages = 0usize;
    loop {
        let page = feeder.guard(backend.query(&request)).await?;
        pages += 1;
        if !page.items.is_empty() {
            feeder.send(page.items).await?;
        }
        match page.last_key {
            Some(last_key) => request.start_key = Some(last_key),
            None => break,
        }
    }
    debug!(
        partition = %request.partition_value,
        index = ?request.index,
        pages,
        "Query exhausted"
    );
    Ok(())
}

/// Fetch and decode every page of `request`, one page after another.
async fn collect_query<T>(
    backend: &dyn KvBackend,
    mut request: QueryRequest,
    decode: impl Fn(&Item) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    loop {
        let page = backend.query(&request).await?;
        for item in &page.items {
            out.push(decode(item)?);
        }
        match page.last_key {
            Some(last_key) => request.start_key = Some(last_key),
            None => return Ok(out),
        }
    }
}

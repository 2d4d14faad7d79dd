//! Bounded fan-out/fan-in worker pool.
//!
//! A producer pushes items into a channel of capacity P through a [`Feeder`];
//! P workers pull items and run the handler; outputs are fanned back into the
//! caller. Everything runs inside the calling task, so handlers may borrow.
//!
//! ## Failure semantics
//! The first error, from the producer or any handler, cancels the per-call
//! token: the producer stops admitting items, in-flight handlers are
//! abandoned, and that first error is returned. Outputs gathered before the
//! failure are dropped. Cancelling the caller's token yields
//! `StorageError::Cancelled`.
//!
//! With P = 1 items are handled strictly one after another, in admission order.

use std::future::Future;

use futures::future::try_join_all;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::interfaces::{Result, StorageError};

/// Fixed-size pool of cooperative workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    parallelism: usize,
}

impl WorkerPool {
    /// A parallelism of 0 is treated as 1.
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run the pipeline and collect outputs in completion order.
    pub async fn run<I, O, P, PF, H, HF>(
        &self,
        ctx: &CancellationToken,
        produce: P,
        handle: H,
    ) -> Result<Vec<O>>
    where
        P: FnOnce(Feeder<I>) -> PF,
        PF: Future<Output = Result<()>>,
        H: Fn(I) -> HF,
        HF: Future<Output = Result<O>>,
    {
        let mut outputs = Vec::new();
        self.drive(ctx, produce, handle, |_, output| outputs.push(output))
            .await?;
        Ok(outputs)
    }

    /// Run the pipeline and collect outputs in admission order.
    pub async fn run_ordered<I, O, P, PF, H, HF>(
        &self,
        ctx: &CancellationToken,
        produce: P,
        handle: H,
    ) -> Result<Vec<O>>
    where
        P: FnOnce(Feeder<I>) -> PF,
        PF: Future<Output = Result<()>>,
        H: Fn(I) -> HF,
        HF: Future<Output = Result<O>>,
    {
        let mut outputs = Vec::new();
        self.drive(ctx, produce, handle, |index, output| {
            outputs.push((index, output))
        })
        .await?;
        outputs.sort_by_key(|(index, _)| *index);
        Ok(outputs.into_iter().map(|(_, output)| output).collect())
    }

    /// Run the pipeline, handing each output to `sink` as it arrives.
    ///
    /// `sink` runs on the calling task, never concurrently with itself. On
    /// error, outputs already handed over stay handed over.
    pub async fn run_for_each<I, O, P, PF, H, HF, S>(
        &self,
        ctx: &CancellationToken,
        produce: P,
        handle: H,
        mut sink: S,
    ) -> Result<()>
    where
        P: FnOnce(Feeder<I>) -> PF,
        PF: Future<Output = Result<()>>,
        H: Fn(I) -> HF,
        HF: Future<Output = Result<O>>,
        S: FnMut(O),
    {
        self.drive(ctx, produce, handle, |_, output| sink(output))
            .await
    }

    async fn drive<I, O, P, PF, H, HF, S>(
        &self,
        ctx: &CancellationToken,
        produce: P,
        handle: H,
        mut sink: S,
    ) -> Result<()>
    where
        P: FnOnce(Feeder<I>) -> PF,
        PF: Future<Output = Result<()>>,
        H: Fn(I) -> HF,
        HF: Future<Output = Result<O>>,
        S: FnMut(usize, O),
    {
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let parallelism = self.parallelism;
        let token = ctx.child_token();
        let (item_tx, item_rx) = mpsc::channel::<(usize, I)>(parallelism);
        let (out_tx, mut out_rx) = mpsc::channel::<(usize, O)>(parallelism);

        let feeder = Feeder {
            tx: item_tx,
            token: token.clone(),
            next: 0,
        };

        let producer_token = token.clone();
        let producer = async move {
            let result = produce(feeder).await;
            if result.is_err() {
                producer_token.cancel();
            }
            result
        };

        // Owns the output sender, so the drain loop ends once all workers are done.
        let work = async move {
            let item_rx = Mutex::new(item_rx);
            let workers =
                (0..parallelism).map(|_| worker(&item_rx, &out_tx, &handle, &token));
            futures::try_join!(producer, try_join_all(workers)).map(|_| ())
        };

        let drain = async {
            while let Some((index, output)) = out_rx.recv().await {
                sink(index, output);
            }
        };

        let (result, ()) = tokio::join!(work, drain);
        result
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(2)
    }
}

async fn worker<I, O, H, HF>(
    items: &Mutex<mpsc::Receiver<(usize, I)>>,
    outputs: &mpsc::Sender<(usize, O)>,
    handle: &H,
    token: &CancellationToken,
) -> Result<()>
where
    H: Fn(I) -> HF,
    HF: Future<Output = Result<O>>,
{
    loop {
        let next = {
            let mut rx = items.lock().await;
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(StorageError::Cancelled),
                next = rx.recv() => next,
            }
        };
        let Some((index, item)) = next else {
            return Ok(());
        };

        let output = match with_cancel(token, handle(item)).await {
            Ok(output) => output,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StorageError::Cancelled),
            sent = outputs.send((index, output)) => {
                if sent.is_err() {
                    return Err(StorageError::Cancelled);
                }
            }
        }
    }
}

/// Producer side of a pipeline.
pub struct Feeder<I> {
    tx: mpsc::Sender<(usize, I)>,
    token: CancellationToken,
    next: usize,
}

impl<I> Feeder<I> {
    /// Admit one item. Waits while the channel is full; fails with
    /// `Cancelled` once the pipeline is cancelled.
    pub async fn send(&mut self, item: I) -> Result<()> {
        let index = self.next;
        self.next += 1;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StorageError::Cancelled),
            sent = self.tx.send((index, item)) => sent.map_err(|_| StorageError::Cancelled),
        }
    }

    /// Await `fut` unless the pipeline is cancelled first.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_cancel(&self.token, fut).await
    }
}

/// Producer that admits every element of `items`, in order.
pub async fn feed_all<I>(mut feeder: Feeder<I>, items: impl IntoIterator<Item = I>) -> Result<()> {
    for item in items {
        feeder.send(item).await?;
    }
    Ok(())
}

/// Await `fut`, abandoning it with `Cancelled` if `token` fires first.
pub async fn with_cancel<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// Split `items` into chunks of at most `size` (a size of 0 is treated as 1).
pub fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

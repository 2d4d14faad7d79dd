//! Conditional root writes followed by pipelined step batches.
//!
//! The root is the commit point. Once its conditional write lands, step puts
//! and stale-step deletes are submitted in chunks; if a chunk fails the root
//! stays committed and the error is returned.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::KifuStore;
use crate::interfaces::{Condition, Conditional, Result, StorageError, WriteRequest};
use crate::kifu::{Kifu, Step, Version};
use crate::storage::codec::{decode_step_count, encode_root, encode_step, VERSION_ATTR};
use crate::storage::item::AttrValue;
use crate::storage::keys::{root_key, step_key};
use crate::storage::pipeline::{chunked, feed_all, with_cancel};

impl KifuStore {
    /// Store `kifu` with `steps`, replacing any previous steps.
    ///
    /// `expected_version = None` creates; the write is rejected with
    /// `OptimisticLock` if the kifu already exists. `Some(v)` replaces a
    /// kifu stored under version `v`, or creates it if absent. The stored
    /// `step_count` is derived from `steps`.
    ///
    /// Returns the new version.
    pub async fn put_kifu(
        &self,
        ctx: &CancellationToken,
        kifu: &Kifu,
        steps: &[Step],
        expected_version: Option<&Version>,
    ) -> Result<Version> {
        let step_count = validate_steps(kifu, steps)?;
        let root = Kifu {
            step_count,
            ..kifu.clone()
        };
        let version = Version::generate();

        let condition = match expected_version {
            None => Condition::NotExists,
            Some(expected) => Condition::NotExistsOrEquals {
                attr: VERSION_ATTR.to_string(),
                value: AttrValue::S(expected.as_str().to_string()),
            },
        };

        let outcome = with_cancel(
            ctx,
            self.backend.put_if(encode_root(&root, &version), condition),
        )
        .await?;
        let previous = match outcome {
            Conditional::Applied { previous } => previous,
            Conditional::Rejected { .. } => {
                warn!(
                    kifu_id = %root.kifu_id,
                    expected = ?expected_version.map(Version::as_str),
                    "Version mismatch on put"
                );
                return Err(StorageError::OptimisticLock {
                    kifu_id: root.kifu_id,
                });
            }
        };

        let previous_count = previous.as_ref().map(decode_step_count).transpose()?;
        let mut requests: Vec<WriteRequest> = steps
            .iter()
            .map(|step| WriteRequest::Put(encode_step(step)))
            .collect();
        let stale = stale_seqs(steps, step_count, previous_count);
        if !stale.is_empty() {
            warn!(
                kifu_id = %root.kifu_id,
                stale = stale.len(),
                "Removing steps left over from the previous version"
            );
        }
        requests.extend(
            stale
                .into_iter()
                .map(|seq| WriteRequest::Delete(step_key(&root.kifu_id, seq))),
        );

        let chunks = self.write_chunks(ctx, requests).await?;
        info!(
            kifu_id = %root.kifu_id,
            owner = %root.owner_id,
            step_count,
            chunks,
            version = %version,
            "Stored kifu"
        );
        Ok(version)
    }

    /// Delete a kifu stored under `expected_version`, then its steps.
    ///
    /// `NotFound` if no root exists; `OptimisticLock` if it exists under
    /// another version.
    pub async fn delete_kifu(
        &self,
        ctx: &CancellationToken,
        kifu_id: &str,
        expected_version: &Version,
    ) -> Result<()> {
        let condition = Condition::Equals {
            attr: VERSION_ATTR.to_string(),
            value: AttrValue::S(expected_version.as_str().to_string()),
        };

        let outcome = with_cancel(ctx, self.backend.delete_if(&root_key(kifu_id), condition))
            .await?;
        let previous = match outcome {
            Conditional::Applied {
                previous: Some(previous),
            } => previous,
            Conditional::Applied { previous: None } | Conditional::Rejected { current: None } => {
                return Err(StorageError::NotFound(format!("kifu {kifu_id}")));
            }
            Conditional::Rejected { current: Some(_) } => {
                warn!(kifu_id = %kifu_id, expected = %expected_version, "Version mismatch on delete");
                return Err(StorageError::OptimisticLock {
                    kifu_id: kifu_id.to_string(),
                });
            }
        };

        let step_count = decode_step_count(&previous)?;
        let requests = (0..=step_count)
            .map(|seq| WriteRequest::Delete(step_key(kifu_id, seq)))
            .collect();
        let chunks = self.write_chunks(ctx, requests).await?;

        info!(kifu_id = %kifu_id, step_count, chunks, "Deleted kifu");
        Ok(())
    }

    /// Submit `requests` in chunks through the pool. Returns the chunk count.
    async fn write_chunks(
        &self,
        ctx: &CancellationToken,
        requests: Vec<WriteRequest>,
    ) -> Result<usize> {
        let chunks = chunked(requests, self.batch_write_size);
        let count = chunks.len();
        debug!(chunks = count, parallelism = self.pool.parallelism(), "Writing batches");

        let backend = self.backend.as_ref();
        self.pool
            .run(
                ctx,
                |feeder| feed_all(feeder, chunks),
                |chunk| backend.batch_write(chunk),
            )
            .await?;
        Ok(count)
    }
}

/// Check that `steps` belong to `kifu` and are contiguous from seq 0 or 1.
/// Returns the step count, the highest seq.
fn validate_steps(kifu: &Kifu, steps: &[Step]) -> Result<u32> {
    if kifu.kifu_id.is_empty() {
        return Err(StorageError::InvalidArgument("kifu_id is empty".to_string()));
    }
    if kifu.owner_id.is_empty() {
        return Err(StorageError::InvalidArgument("owner_id is empty".to_string()));
    }
    if let Some(step) = steps
        .iter()
        .find(|s| s.kifu_id != kifu.kifu_id || s.owner_id != kifu.owner_id)
    {
        return Err(StorageError::InvalidArgument(format!(
            "step {} belongs to {}/{}, not {}/{}",
            step.seq, step.owner_id, step.kifu_id, kifu.owner_id, kifu.kifu_id
        )));
    }

    let mut seqs: Vec<u32> = steps.iter().map(|s| s.seq).collect();
    seqs.sort_unstable();
    let Some(&first) = seqs.first() else {
        return Ok(0);
    };
    if first > 1 {
        return Err(StorageError::InvalidArgument(format!(
            "steps must start at seq 0 or 1, got {first}"
        )));
    }
    if let Some(pair) = seqs.windows(2).find(|w| w[1] != w[0] + 1) {
        return Err(StorageError::InvalidArgument(format!(
            "steps are not contiguous: seq {} follows {}",
            pair[1], pair[0]
        )));
    }
    Ok(seqs[seqs.len() - 1])
}

/// Seqs stored by the previous version that the new step set does not cover.
fn stale_seqs(steps: &[Step], step_count: u32, previous_count: Option<u32>) -> Vec<u32> {
    let Some(previous_count) = previous_count else {
        return Vec::new();
    };
    let mut stale: Vec<u32> = (step_count.saturating_add(1)..=previous_count).collect();
    if !steps.iter().any(|s| s.seq == 0) {
        stale.insert(0, 0);
    }
    stale
}

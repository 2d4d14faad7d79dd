//! Scatter-gather search for kifu that reached a given position.
//!
//! Phase 1 scans the position index once per owner; phase 2 fetches the
//! steps following every hit. Both phases fan out through the pool.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{collect_query, KifuStore};
use crate::interfaces::{QueryRequest, Result};
use crate::kifu::SamePosition;
use crate::storage::codec::{decode_position_entry, decode_step, PositionEntry};
use crate::storage::item::PK_ATTR;
use crate::storage::keys::{
    kifu_partition, position_partition, step_range, POSITION_INDEX, POSITION_KEY_ATTR,
};
use crate::storage::pipeline::feed_all;

impl KifuStore {
    /// Kifu of `owner_ids` whose steps reached `position`, each with the
    /// `num_step` steps starting at the matching one. Kifu listed in
    /// `exclude_kifu_ids` are skipped. Result order is unspecified.
    pub async fn get_same_positions(
        &self,
        ctx: &CancellationToken,
        owner_ids: &[String],
        position: &str,
        num_step: Option<u32>,
        exclude_kifu_ids: &[String],
    ) -> Result<Vec<SamePosition>> {
        if owner_ids.is_empty() || position.is_empty() {
            return Ok(Vec::new());
        }
        let num_step = num_step.unwrap_or(self.default_num_step);
        let owners: HashSet<&str> = owner_ids.iter().map(String::as_str).collect();
        let excluded: HashSet<&str> = exclude_kifu_ids.iter().map(String::as_str).collect();
        let backend = self.backend.as_ref();

        let hits = self
            .pool
            .run(
                ctx,
                |feeder| feed_all(feeder, owners.iter().map(|o| o.to_string())),
                |owner: String| {
                    let request = QueryRequest::index(
                        POSITION_INDEX,
                        POSITION_KEY_ATTR,
                        position_partition(&owner, position),
                    );
                    let owners = &owners;
                    let excluded = &excluded;
                    async move {
                        let entries = collect_query(backend, request, decode_position_entry).await?;
                        Ok(entries
                            .into_iter()
                            .filter(|e| {
                                owners.contains(e.owner_id.as_str())
                                    && !excluded.contains(e.kifu_id.as_str())
                            })
                            .collect::<Vec<_>>())
                    }
                },
            )
            .await?;
        let hits: Vec<PositionEntry> = hits.into_iter().flatten().collect();
        debug!(owners = owners.len(), hits = hits.len(), "Position index scanned");

        if num_step == 0 {
            return Ok(hits
                .into_iter()
                .map(|hit| SamePosition {
                    owner_id: hit.owner_id,
                    kifu_id: hit.kifu_id,
                    seq: hit.seq,
                    steps: Vec::new(),
                })
                .collect());
        }

        self.pool
            .run(
                ctx,
                |feeder| feed_all(feeder, hits),
                |hit: PositionEntry| async move {
                    let mut request = QueryRequest::partition(PK_ATTR, kifu_partition(&hit.kifu_id));
                    request.range = step_range(hit.seq, hit.seq.saturating_add(num_step));
                    let mut steps = collect_query(backend, request, decode_step).await?;
                    steps.sort_by_key(|s| s.seq);
                    Ok(SamePosition {
                        owner_id: hit.owner_id,
                        kifu_id: hit.kifu_id,
                        seq: hit.seq,
                        steps,
                    })
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::{kifu, steps};
    use super::*;
    use crate::config::StoreConfig;
    use crate::interfaces::StorageError;
    use crate::kifu::Step;
    use crate::storage::mock::MemoryBackend;

    fn owners(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded(page_size: usize) -> (Arc<MemoryBackend>, KifuStore) {
        let backend = Arc::new(MemoryBackend::with_page_size(page_size));
        let store = KifuStore::new(backend.clone(), &StoreConfig::default()).unwrap();
        let ctx = CancellationToken::new();

        for (owner, id, count) in [("u1", "a", 12), ("u1", "b", 4), ("u2", "c", 8)] {
            store
                .put_kifu(&ctx, &kifu(owner, id, 1), &steps(owner, id, count), None)
                .await
                .unwrap();
        }
        (backend, store)
    }

    fn seqs(steps: &[Step]) -> Vec<u32> {
        steps.iter().map(|s| s.seq).collect()
    }

    #[tokio::test]
    async fn test_finds_matches_with_following_steps() {
        let (_, store) = seeded(100).await;
        let ctx = CancellationToken::new();

        let mut found = store
            .get_same_positions(&ctx, &owners(&["u1", "u2"]), "p3", Some(3), &[])
            .await
            .unwrap();
        found.sort_by(|a, b| a.kifu_id.cmp(&b.kifu_id));

        let ids: Vec<_> = found.iter().map(|m| m.kifu_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(seqs(&found[0].steps), vec![3, 4, 5]);
        // Kifu b ends at seq 4.
        assert_eq!(seqs(&found[1].steps), vec![3, 4]);
        assert!(found.iter().all(|m| m.seq == 3));
    }

    #[tokio::test]
    async fn test_scoped_to_owners_and_exclusions() {
        let (_, store) = seeded(2).await;
        let ctx = CancellationToken::new();

        let found = store
            .get_same_positions(&ctx, &owners(&["u1"]), "p2", None, &owners(&["a"]))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kifu_id, "b");
        assert_eq!(found[0].owner_id, "u1");
        assert_eq!(seqs(&found[0].steps), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_default_num_step() {
        let (_, store) = seeded(100).await;
        let ctx = CancellationToken::new();

        let found = store
            .get_same_positions(&ctx, &owners(&["u1"]), "p0", None, &owners(&["b"]))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(seqs(&found[0].steps), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_empty_owner_list_skips_backend() {
        let (backend, store) = seeded(100).await;
        let ctx = CancellationToken::new();
        let queries = backend.query_calls();

        let found = store
            .get_same_positions(&ctx, &[], "p1", None, &[])
            .await
            .unwrap();

        assert!(found.is_empty());
        assert_eq!(backend.query_calls(), queries);
    }

    #[tokio::test]
    async fn test_unknown_position() {
        let (_, store) = seeded(100).await;
        let ctx = CancellationToken::new();

        let found = store
            .get_same_positions(&ctx, &owners(&["u1", "u2"]), "nowhere", None, &[])
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_propagates() {
        let (backend, store) = seeded(100).await;
        let ctx = CancellationToken::new();
        backend.set_fail_on_query(true).await;

        let err = store
            .get_same_positions(&ctx, &owners(&["u1"]), "p1", None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }
}

//! Point reads, partition reads, owner-index scans and signature lookups.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{collect_query, feed_pages, KifuStore};
use crate::interfaces::{QueryRequest, Result, StorageError};
use crate::kifu::{Kifu, KifuSignature, Step, Version};
use crate::storage::codec::{decode_record, decode_root, decode_signature, describe, Record};
use crate::storage::item::{Item, PK_ATTR};
use crate::storage::keys::{
    kifu_partition, root_key, OWNER_ATTR, OWNER_INDEX, SIGNATURE_INDEX, SIGNATURE_KEY_ATTR,
};
use crate::storage::pipeline::with_cancel;

impl KifuStore {
    /// Root record of `kifu_id` and its current version.
    pub async fn get_kifu(&self, ctx: &CancellationToken, kifu_id: &str) -> Result<(Kifu, Version)> {
        let item = with_cancel(ctx, self.backend.get(&root_key(kifu_id)))
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("kifu {kifu_id}")))?;
        decode_root(&item).inspect_err(|e| log_corrupt(&item, e))
    }

    /// Root, steps sorted by seq, and version of `kifu_id`, from one
    /// partition query. Pages are decoded in the pool.
    pub async fn get_kifu_and_steps(
        &self,
        ctx: &CancellationToken,
        kifu_id: &str,
    ) -> Result<(Kifu, Vec<Step>, Version)> {
        let request = QueryRequest::partition(PK_ATTR, kifu_partition(kifu_id));
        let backend = self.backend.as_ref();

        let pages = self
            .pool
            .run(
                ctx,
                |feeder| feed_pages(backend, request, feeder),
                |items: Vec<Item>| async move { decode_page(&items, decode_record) },
            )
            .await?;

        let mut root = None;
        let mut steps = Vec::new();
        for record in pages.into_iter().flatten() {
            match record {
                Record::Root(kifu, version) => root = Some((kifu, version)),
                Record::Step(step) => steps.push(step),
            }
        }
        let Some((kifu, version)) = root else {
            if !steps.is_empty() {
                warn!(kifu_id = %kifu_id, steps = steps.len(), "Steps stored without a root");
            }
            return Err(StorageError::NotFound(format!("kifu {kifu_id}")));
        };

        steps.sort_by_key(|s| s.seq);
        if steps.last().map_or(0, |s| s.seq) != kifu.step_count {
            // A failed put or delete can leave steps out of line with the root.
            warn!(
                kifu_id = %kifu_id,
                step_count = kifu.step_count,
                found = steps.len(),
                "Stored steps disagree with root"
            );
        }
        debug!(kifu_id = %kifu_id, steps = steps.len(), "Loaded kifu");
        Ok((kifu, steps, version))
    }

    /// Call `f` once per root owned by `owner_id`. Order across pages is
    /// unspecified.
    pub async fn list_kifu<F>(&self, ctx: &CancellationToken, owner_id: &str, mut f: F) -> Result<()>
    where
        F: FnMut(Kifu, Version),
    {
        let request = QueryRequest::index(OWNER_INDEX, OWNER_ATTR, owner_id);
        let backend = self.backend.as_ref();

        self.pool
            .run_for_each(
                ctx,
                |feeder| feed_pages(backend, request, feeder),
                |items: Vec<Item>| async move { decode_page(&items, decode_root) },
                |roots: Vec<(Kifu, Version)>| {
                    for (kifu, version) in roots {
                        f(kifu, version);
                    }
                },
            )
            .await
    }

    /// Up to `limit` roots of `owner_id`, most recently created first.
    pub async fn get_recent_kifu(
        &self,
        ctx: &CancellationToken,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Kifu>> {
        let mut recent = Vec::new();
        let mut request = QueryRequest::index(OWNER_INDEX, OWNER_ATTR, owner_id).descending();

        while recent.len() < limit {
            let remaining = u32::try_from(limit - recent.len()).unwrap_or(u32::MAX);
            request.limit = Some(remaining);

            let page = with_cancel(ctx, self.backend.query(&request)).await?;
            for (kifu, _) in decode_page(&page.items, decode_root)? {
                recent.push(kifu);
            }
            match page.last_key {
                Some(last_key) => request.start_key = Some(last_key),
                None => break,
            }
        }
        recent.truncate(limit);

        debug!(owner = %owner_id, limit, found = recent.len(), "Loaded recent kifu");
        Ok(recent)
    }

    /// Kifu of any owner whose final position is `position`.
    pub async fn duplicate_kifu(
        &self,
        ctx: &CancellationToken,
        position: &str,
    ) -> Result<Vec<KifuSignature>> {
        if position.is_empty() {
            return Ok(Vec::new());
        }
        let request = QueryRequest::index(SIGNATURE_INDEX, SIGNATURE_KEY_ATTR, position);
        let found = with_cancel(
            ctx,
            collect_query(self.backend.as_ref(), request, |item: &Item| {
                decode_signature(item).inspect_err(|e| log_corrupt(item, e))
            }),
        )
        .await?;
        debug!(found = found.len(), "Signature lookup");
        Ok(found)
    }
}

fn decode_page<T>(items: &[Item], decode: fn(&Item) -> Result<T>) -> Result<Vec<T>> {
    items
        .iter()
        .map(|item| decode(item).inspect_err(|e| log_corrupt(item, e)))
        .collect()
}

fn log_corrupt(item: &Item, err: &StorageError) {
    error!(key = %describe(item), error = %err, "Undecodable stored item");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::super::test_support::{kifu, steps};
    use super::*;
    use crate::config::StoreConfig;
    use crate::interfaces::{Condition, KvBackend};
    use crate::storage::item::AttrValue;
    use crate::storage::keys::step_key;
    use crate::storage::mock::MemoryBackend;

    fn store(backend: Arc<MemoryBackend>, parallelism: usize) -> KifuStore {
        let config = StoreConfig {
            parallelism,
            ..Default::default()
        };
        KifuStore::new(backend, &config).unwrap()
    }

    #[tokio::test]
    async fn test_get_kifu_not_found() {
        let store = store(Arc::new(MemoryBackend::new()), 2);
        let ctx = CancellationToken::new();

        let err = store.get_kifu(&ctx, "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_kifu_backend_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        store
            .put_kifu(&ctx, &kifu("u1", "k1", 100), &[], None)
            .await
            .unwrap();
        backend.set_fail_on_get(true).await;

        let err = store.get_kifu(&ctx, "k1").await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(err.is_retryable());

        backend.set_fail_on_get(false).await;
        assert!(store.get_kifu(&ctx, "k1").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_kifu_and_steps_across_pages() {
        let backend = Arc::new(MemoryBackend::with_page_size(7));
        let store = store(backend.clone(), 3);
        let ctx = CancellationToken::new();
        let input = steps("u1", "k1", 60);

        let version = store
            .put_kifu(&ctx, &kifu("u1", "k1", 100), &input, None)
            .await
            .unwrap();
        let (root, loaded, loaded_version) = store.get_kifu_and_steps(&ctx, "k1").await.unwrap();

        assert_eq!(root.step_count, 60);
        assert_eq!(loaded, input);
        assert_eq!(loaded_version, version);
        assert!(backend.query_calls() >= 9);
    }

    #[tokio::test]
    async fn test_get_kifu_and_steps_without_root() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        let version = store
            .put_kifu(&ctx, &kifu("u1", "k1", 100), &steps("u1", "k1", 2), None)
            .await
            .unwrap();
        // Simulate a delete that removed the root but not the steps.
        backend
            .delete_if(
                &root_key("k1"),
                Condition::Equals {
                    attr: "version".to_string(),
                    value: AttrValue::S(version.to_string()),
                },
            )
            .await
            .unwrap();

        let err = store.get_kifu_and_steps(&ctx, "k1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(backend.get_stored(&step_key("k1", 1)).await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_step_is_invalid_stored_value() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        store
            .put_kifu(&ctx, &kifu("u1", "k1", 100), &steps("u1", "k1", 2), None)
            .await
            .unwrap();
        let mut item = backend.get_stored(&step_key("k1", 1)).await.unwrap();
        item.remove("seq");
        backend.insert_raw(item).await.unwrap();

        let err = store.get_kifu_and_steps(&ctx, "k1").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidStoredValue(_)));
    }

    #[tokio::test]
    async fn test_list_kifu_visits_every_root_once() {
        let backend = Arc::new(MemoryBackend::with_page_size(3));
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        for i in 0..10 {
            let id = format!("k{i}");
            store
                .put_kifu(&ctx, &kifu("u1", &id, 100 + i), &steps("u1", &id, 2), None)
                .await
                .unwrap();
        }
        store
            .put_kifu(&ctx, &kifu("u2", "other", 50), &[], None)
            .await
            .unwrap();

        let mut seen = Vec::new();
        store
            .list_kifu(&ctx, "u1", |k, _| seen.push(k.kifu_id))
            .await
            .unwrap();

        let unique: HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), 10);
        assert_eq!(unique.len(), 10);
        assert!(!unique.contains("other"));
    }

    #[tokio::test]
    async fn test_list_kifu_query_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();
        backend.set_fail_on_query(true).await;

        let err = store.list_kifu(&ctx, "u1", |_, _| {}).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[tokio::test]
    async fn test_recent_kifu_newest_first() {
        let backend = Arc::new(MemoryBackend::with_page_size(2));
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        for (id, ts) in [("a", 300), ("b", -20), ("c", 1000), ("d", 5)] {
            store
                .put_kifu(&ctx, &kifu("u1", id, ts), &[], None)
                .await
                .unwrap();
        }

        let recent = store.get_recent_kifu(&ctx, "u1", 3).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|k| k.kifu_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "d"]);

        assert!(store.get_recent_kifu(&ctx, "u1", 0).await.unwrap().is_empty());
        assert_eq!(store.get_recent_kifu(&ctx, "u1", 10).await.unwrap().len(), 4);
        assert!(store.get_recent_kifu(&ctx, "nobody", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_kifu_across_owners() {
        let backend = Arc::new(MemoryBackend::with_page_size(1));
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        for (owner, id, position) in [("u1", "a", "end"), ("u2", "b", "end"), ("u1", "c", "other")] {
            let root = Kifu {
                position: position.to_string(),
                ..kifu(owner, id, 100)
            };
            store.put_kifu(&ctx, &root, &[], None).await.unwrap();
        }

        let mut found = store.duplicate_kifu(&ctx, "end").await.unwrap();
        found.sort_by(|x, y| x.kifu_id.cmp(&y.kifu_id));
        assert_eq!(
            found,
            vec![
                KifuSignature {
                    owner_id: "u1".to_string(),
                    kifu_id: "a".to_string(),
                },
                KifuSignature {
                    owner_id: "u2".to_string(),
                    kifu_id: "b".to_string(),
                },
            ]
        );
        assert!(store.duplicate_kifu(&ctx, "nowhere").await.unwrap().is_empty());

        let queries = backend.query_calls();
        assert!(store.duplicate_kifu(&ctx, "").await.unwrap().is_empty());
        assert_eq!(backend.query_calls(), queries);
    }

    #[tokio::test]
    async fn test_duplicate_kifu_follows_deletes_and_reposts() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        let first = Kifu {
            position: "end".to_string(),
            ..kifu("u1", "a", 100)
        };
        let v1 = store.put_kifu(&ctx, &first, &[], None).await.unwrap();
        let moved = Kifu {
            position: "elsewhere".to_string(),
            ..first
        };
        let v2 = store.put_kifu(&ctx, &moved, &[], Some(&v1)).await.unwrap();
        assert!(store.duplicate_kifu(&ctx, "end").await.unwrap().is_empty());
        assert_eq!(store.duplicate_kifu(&ctx, "elsewhere").await.unwrap().len(), 1);

        store.delete_kifu(&ctx, "a", &v2).await.unwrap();
        assert!(store.duplicate_kifu(&ctx, "elsewhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_kifu_unbounded_limit() {
        let backend = Arc::new(MemoryBackend::with_page_size(2));
        let store = store(backend.clone(), 2);
        let ctx = CancellationToken::new();

        assert!(store
            .get_recent_kifu(&ctx, "u1", usize::MAX)
            .await
            .unwrap()
            .is_empty());

        for i in 0..5 {
            let id = format!("k{i}");
            store
                .put_kifu(&ctx, &kifu("u1", &id, 100 + i), &[], None)
                .await
                .unwrap();
        }
        let recent = store.get_recent_kifu(&ctx, "u1", usize::MAX).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|k| k.kifu_id.as_str()).collect();
        assert_eq!(ids, vec!["k4", "k3", "k2", "k1", "k0"]);
    }
}

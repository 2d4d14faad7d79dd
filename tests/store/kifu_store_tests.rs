//! KifuStore behaviour tests.
//!
//! Every test uses fresh kifu and owner ids, so one store can run them all.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use kansousen::interfaces::StorageError;
use kansousen::kifu::{FinishedStatus, Kifu, Piece, Pos, Step};
use kansousen::storage::KifuStore;

pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Create a root for `owner_id`/`kifu_id`.
pub fn make_kifu(owner_id: &str, kifu_id: &str, created_ts: i64) -> Kifu {
    Kifu {
        owner_id: owner_id.to_string(),
        kifu_id: kifu_id.to_string(),
        created_ts,
        start_ts: created_ts - 600,
        end_ts: Some(created_ts - 10),
        position: format!("end-of-{kifu_id}"),
        handicap: "平手".to_string(),
        game_name: format!("game {kifu_id}"),
        first_players: vec!["sente".to_string()],
        second_players: vec!["gote".to_string()],
        ..Default::default()
    }
}

/// Create steps 0..=count. Step `seq` reaches position `{tag}-{seq}`.
pub fn make_steps(owner_id: &str, kifu_id: &str, count: u32, tag: &str) -> Vec<Step> {
    (0..=count)
        .map(|seq| Step {
            owner_id: owner_id.to_string(),
            kifu_id: kifu_id.to_string(),
            seq,
            position: format!("{tag}-{seq}"),
            src: (seq > 0).then_some(Pos { x: 2, y: 7 }),
            dst: (seq > 0).then_some(Pos { x: 2, y: 6 }),
            piece: if seq > 0 { Piece::Fu } else { Piece::Null },
            finished_status: if seq == count && seq > 0 {
                FinishedStatus::Surrender
            } else {
                FinishedStatus::NotFinished
            },
            timestamp_sec: seq * 5,
            thinking_sec: 5,
            notes: if seq % 3 == 0 {
                vec![format!("note {seq}")]
            } else {
                Vec::new()
            },
            ..Default::default()
        })
        .collect()
}

// =============================================================================
// Write/read round trip
// =============================================================================

pub async fn test_round_trip(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");
    let kifu = make_kifu(&owner, &kifu_id, 1_700_000_000);
    let steps = make_steps(&owner, &kifu_id, 57, "rt");

    let version = store
        .put_kifu(&ctx, &kifu, &steps, None)
        .await
        .expect("put should succeed");

    let (root, loaded, loaded_version) = store
        .get_kifu_and_steps(&ctx, &kifu_id)
        .await
        .expect("get should succeed");
    assert_eq!(loaded_version, version);
    assert_eq!(root.step_count, 57);
    assert_eq!(
        root,
        Kifu {
            step_count: 57,
            ..kifu
        }
    );
    assert_eq!(loaded, steps, "steps should round-trip in seq order");

    let (point, point_version) = store.get_kifu(&ctx, &kifu_id).await.unwrap();
    assert_eq!(point, root);
    assert_eq!(point_version, version);
}

pub async fn test_empty_step_set(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");

    store
        .put_kifu(&ctx, &make_kifu(&owner, &kifu_id, 1), &[], None)
        .await
        .unwrap();

    let (root, steps, _) = store.get_kifu_and_steps(&ctx, &kifu_id).await.unwrap();
    assert_eq!(root.step_count, 0);
    assert!(steps.is_empty());
}

// =============================================================================
// Replacement
// =============================================================================

pub async fn test_shrink_removes_stale_steps(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");
    let kifu = make_kifu(&owner, &kifu_id, 10);

    let v1 = store
        .put_kifu(&ctx, &kifu, &make_steps(&owner, &kifu_id, 40, "long"), None)
        .await
        .unwrap();
    let short = make_steps(&owner, &kifu_id, 4, "short");
    let v2 = store
        .put_kifu(&ctx, &kifu, &short, Some(&v1))
        .await
        .expect("replace with current version should succeed");
    assert_ne!(v1, v2);

    let (root, steps, version) = store.get_kifu_and_steps(&ctx, &kifu_id).await.unwrap();
    assert_eq!(version, v2);
    assert_eq!(root.step_count, 4);
    assert_eq!(steps, short, "no step beyond the new count may survive");

    let owners = [owner.clone()];
    let beyond = store
        .get_same_positions(&ctx, &owners, "long-10", None, &[])
        .await
        .unwrap();
    assert!(beyond.is_empty(), "removed steps must leave the position index");

    let replaced = store
        .get_same_positions(&ctx, &owners, "long-2", None, &[])
        .await
        .unwrap();
    assert!(replaced.is_empty(), "overwritten steps must leave the position index");

    let current = store
        .get_same_positions(&ctx, &owners, "short-2", None, &[])
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].kifu_id, kifu_id);
    assert_eq!(current[0].seq, 2);
    let seqs: Vec<u32> = current[0].steps.iter().map(|s| s.seq).collect();
    assert_eq!(seqs, vec![2, 3, 4]);
}

pub async fn test_repost_without_start_position(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");
    let kifu = make_kifu(&owner, &kifu_id, 10);

    let v1 = store
        .put_kifu(&ctx, &kifu, &make_steps(&owner, &kifu_id, 5, "full"), None)
        .await
        .unwrap();
    let moves_only: Vec<Step> = make_steps(&owner, &kifu_id, 5, "moves")
        .into_iter()
        .skip(1)
        .collect();
    store
        .put_kifu(&ctx, &kifu, &moves_only, Some(&v1))
        .await
        .expect("steps starting at 1 are accepted");

    let (root, steps, _) = store.get_kifu_and_steps(&ctx, &kifu_id).await.unwrap();
    assert_eq!(root.step_count, 5);
    assert_eq!(steps, moves_only, "seq 0 of the previous set must be removed");

    let start = store
        .get_same_positions(&ctx, &[owner.clone()], "full-0", None, &[])
        .await
        .unwrap();
    assert!(start.is_empty());
}

pub async fn test_replace_with_old_version_fails(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");
    let kifu = make_kifu(&owner, &kifu_id, 10);
    let steps = make_steps(&owner, &kifu_id, 3, "a");

    let v1 = store.put_kifu(&ctx, &kifu, &steps, None).await.unwrap();
    let v2 = store.put_kifu(&ctx, &kifu, &steps, Some(&v1)).await.unwrap();

    let err = store
        .put_kifu(&ctx, &kifu, &make_steps(&owner, &kifu_id, 9, "b"), Some(&v1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::OptimisticLock { .. }));

    let (_, loaded, version) = store.get_kifu_and_steps(&ctx, &kifu_id).await.unwrap();
    assert_eq!(version, v2);
    assert_eq!(loaded, steps, "a rejected put writes nothing");
}

pub async fn test_concurrent_puts_one_wins(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");
    let kifu = make_kifu(&owner, &kifu_id, 10);

    let v1 = store
        .put_kifu(&ctx, &kifu, &make_steps(&owner, &kifu_id, 2, "base"), None)
        .await
        .unwrap();

    let steps_a = make_steps(&owner, &kifu_id, 6, "a");
    let steps_b = make_steps(&owner, &kifu_id, 8, "b");
    let (a, b) = tokio::join!(
        store.put_kifu(&ctx, &kifu, &steps_a, Some(&v1)),
        store.put_kifu(&ctx, &kifu, &steps_b, Some(&v1)),
    );

    let (winner, winner_steps) = match (a, b) {
        (Ok(v), Err(StorageError::OptimisticLock { .. })) => (v, steps_a),
        (Err(StorageError::OptimisticLock { .. }), Ok(v)) => (v, steps_b),
        other => panic!("exactly one put must win, got {other:?}"),
    };

    let (_, loaded, version) = store.get_kifu_and_steps(&ctx, &kifu_id).await.unwrap();
    assert_eq!(version, winner);
    assert_eq!(loaded, winner_steps);
}

// =============================================================================
// Delete
// =============================================================================

pub async fn test_delete_then_get(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let kifu_id = unique("kifu");

    let version = store
        .put_kifu(
            &ctx,
            &make_kifu(&owner, &kifu_id, 10),
            &make_steps(&owner, &kifu_id, 30, "del"),
            None,
        )
        .await
        .unwrap();
    store.delete_kifu(&ctx, &kifu_id, &version).await.unwrap();

    assert!(matches!(
        store.get_kifu(&ctx, &kifu_id).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        store.get_kifu_and_steps(&ctx, &kifu_id).await,
        Err(StorageError::NotFound(_))
    ));
    let found = store
        .get_same_positions(&ctx, &[owner.clone()], "del-3", None, &[])
        .await
        .unwrap();
    assert!(found.is_empty(), "deleted steps must leave the position index");

    let err = store.delete_kifu(&ctx, &kifu_id, &version).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

// =============================================================================
// Owner listing and recency
// =============================================================================

pub async fn test_owner_listing_and_recency(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("u1");
    let other = unique("u2");

    for i in 0..10i64 {
        let kifu_id = format!("{owner}-k{i}");
        store
            .put_kifu(
                &ctx,
                &make_kifu(&owner, &kifu_id, 1_000 + i * 60),
                &make_steps(&owner, &kifu_id, 3, "scenario"),
                None,
            )
            .await
            .unwrap();
    }
    let foreign = format!("{other}-k0");
    store
        .put_kifu(&ctx, &make_kifu(&other, &foreign, 99_999), &[], None)
        .await
        .unwrap();

    let recent = store.get_recent_kifu(&ctx, &owner, 3).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|k| k.kifu_id.clone()).collect();
    assert_eq!(
        ids,
        vec![
            format!("{owner}-k9"),
            format!("{owner}-k8"),
            format!("{owner}-k7"),
        ]
    );

    let mut listed = Vec::new();
    store
        .list_kifu(&ctx, &owner, |kifu, _| listed.push(kifu.kifu_id))
        .await
        .unwrap();
    let unique_ids: HashSet<_> = listed.iter().cloned().collect();
    assert_eq!(listed.len(), 10, "every root exactly once");
    assert_eq!(unique_ids.len(), 10);
    assert!(!unique_ids.contains(&foreign));
}

// =============================================================================
// Same-position search
// =============================================================================

pub async fn test_same_positions_with_exclusion(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let owner = unique("owner");
    let tag = unique("pos");
    let ids: Vec<String> = (0..4).map(|i| format!("{owner}-k{i}")).collect();

    for (i, kifu_id) in ids.iter().enumerate() {
        store
            .put_kifu(
                &ctx,
                &make_kifu(&owner, kifu_id, i as i64),
                &make_steps(&owner, kifu_id, 10, &tag),
                None,
            )
            .await
            .unwrap();
    }

    let position = format!("{tag}-4");
    let exclude = vec![ids[1].clone()];
    let found = store
        .get_same_positions(&ctx, &[owner.clone()], &position, Some(3), &exclude)
        .await
        .unwrap();

    let found_ids: HashSet<_> = found.iter().map(|m| m.kifu_id.clone()).collect();
    let expected: HashSet<_> = [&ids[0], &ids[2], &ids[3]].into_iter().cloned().collect();
    assert_eq!(found_ids, expected);
    for m in &found {
        assert_eq!(m.owner_id, owner);
        assert_eq!(m.seq, 4);
        let seqs: Vec<u32> = m.steps.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    let none = store
        .get_same_positions(&ctx, &[unique("stranger")], &position, None, &[])
        .await
        .unwrap();
    assert!(none.is_empty(), "search is scoped to the given owners");
}

// =============================================================================
// Duplicate lookup
// =============================================================================

pub async fn test_duplicate_kifu_by_final_position(store: &KifuStore) {
    let ctx = CancellationToken::new();
    let final_position = unique("final");
    let mut ids = Vec::new();

    for owner in [unique("owner"), unique("owner")] {
        let kifu_id = unique("kifu");
        let kifu = Kifu {
            position: final_position.clone(),
            ..make_kifu(&owner, &kifu_id, 10)
        };
        let version = store
            .put_kifu(&ctx, &kifu, &make_steps(&owner, &kifu_id, 2, "dup"), None)
            .await
            .unwrap();
        ids.push((kifu_id, version));
    }

    let found: HashSet<_> = store
        .duplicate_kifu(&ctx, &final_position)
        .await
        .unwrap()
        .into_iter()
        .map(|sig| sig.kifu_id)
        .collect();
    let expected: HashSet<_> = ids.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(found, expected, "lookup spans owners");

    let (gone, version) = &ids[0];
    store.delete_kifu(&ctx, gone, version).await.unwrap();
    let remaining = store.duplicate_kifu(&ctx, &final_position).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kifu_id, ids[1].0);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all KifuStore tests against a store.
#[macro_export]
macro_rules! run_kifu_store_tests {
    ($store:expr) => {
        use $crate::store::kifu_store_tests::*;

        test_round_trip($store).await;
        println!("  test_round_trip: PASSED");

        test_empty_step_set($store).await;
        println!("  test_empty_step_set: PASSED");

        test_shrink_removes_stale_steps($store).await;
        println!("  test_shrink_removes_stale_steps: PASSED");

        test_repost_without_start_position($store).await;
        println!("  test_repost_without_start_position: PASSED");

        test_replace_with_old_version_fails($store).await;
        println!("  test_replace_with_old_version_fails: PASSED");

        test_concurrent_puts_one_wins($store).await;
        println!("  test_concurrent_puts_one_wins: PASSED");

        test_delete_then_get($store).await;
        println!("  test_delete_then_get: PASSED");

        test_owner_listing_and_recency($store).await;
        println!("  test_owner_listing_and_recency: PASSED");

        test_same_positions_with_exclusion($store).await;
        println!("  test_same_positions_with_exclusion: PASSED");

        test_duplicate_kifu_by_final_position($store).await;
        println!("  test_duplicate_kifu_by_final_position: PASSED");
    };
}

mod common;

use std::collections::BTreeSet;

use epochroll::schema::{EpochRange, Field};
use epochroll::store::Level;

use common::{expected, Stack, ENTITIES};

#[tokio::test]
async fn test_levels_agree_with_raw_epochs() {
    let stack = Stack::new().await;
    assert_eq!(stack.insert(23, 64, BTreeSet::new()).await, 24);
    assert_eq!(stack.roll().await, (6, 2));

    let mut want = expected(0..12);
    want.extend(expected(12..24));
    want.sort_by_key(|r| (r.entity, r.range.start));
    assert_eq!(stack.tier_rows(&stack.daily).await, want);

    let hourly = stack.tier_rows(&stack.hourly).await;
    assert_eq!(hourly.len() as u64, 6 * ENTITIES);
    for entity in 0..ENTITIES {
        let total: i64 = hourly
            .iter()
            .filter(|r| r.entity == entity)
            .map(|r| r.values[Field::AttestationReward])
            .sum();
        assert_eq!(total, expected(0..24)[entity as usize].values[Field::AttestationReward]);
    }
}

#[tokio::test]
async fn test_rerunning_rollups_changes_nothing() {
    let stack = Stack::new().await;
    stack.advance(23).await;
    let hourly = stack.tier_rows(&stack.hourly).await;
    let daily = stack.tier_rows(&stack.daily).await;

    assert_eq!(stack.roll().await, (0, 0));
    assert_eq!(stack.tier_rows(&stack.hourly).await, hourly);
    assert_eq!(stack.tier_rows(&stack.daily).await, daily);
}

#[tokio::test]
async fn test_partial_buckets_fill_in_as_epochs_arrive() {
    let stack = Stack::new().await;
    stack.advance(5).await;

    let last = stack.store.buckets().last(Level::Hourly).await.expect("last");
    let last = last.expect("hourly bucket");
    assert_eq!(last.range, EpochRange::new(4, 8));
    assert_eq!(last.covered_end, 6);
    assert!(!last.is_complete());

    // The partial hourly bucket rolls up into a partial daily one.
    assert_eq!(stack.tier_rows(&stack.hourly).await.len() as u64, 2 * ENTITIES);
    assert_eq!(stack.tier_rows(&stack.daily).await, expected(0..6));

    stack.advance(11).await;
    let last = stack.store.buckets().last(Level::Hourly).await.expect("last");
    assert!(last.expect("hourly bucket").is_complete());
    assert_eq!(stack.tier_rows(&stack.daily).await, expected(0..12));
}

#[tokio::test]
async fn test_gap_holds_back_rollups_until_repaired() {
    let stack = Stack::new().await;
    stack.advance(9).await;

    // Epochs after 10 arrive first.
    assert_eq!(stack.insert(12, 2, BTreeSet::from([11, 12])).await, 2);
    stack.roll().await;
    let last = stack.store.buckets().last(Level::Hourly).await.expect("last");
    assert_eq!(last.expect("hourly bucket").covered_end, 10);

    assert_eq!(stack.insert(12, 2, BTreeSet::from([10])).await, 1);
    stack.roll().await;
    let last = stack.store.buckets().last(Level::Hourly).await.expect("last");
    let last = last.expect("hourly bucket");
    assert_eq!(last.range, EpochRange::new(12, 16));
    assert_eq!(last.covered_end, 13);
}

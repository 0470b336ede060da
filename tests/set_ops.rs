use std::collections::BTreeSet;
use std::sync::Arc;

use pinstore::query::op::{JoinCond, JoinKind, KeyRef, SetOpKind};
use pinstore::query::{Cursor, QueryCtx, QueryVar, SimpleVar, SourceSpec};
use pinstore::storage::{MemStore, PinRecord};
use pinstore::{PinId, PropId};
use proptest::prelude::*;

const STORED: u64 = 40;
const GROUP: PropId = PropId(2);

/// PINs `1..=STORED`; property 2 holds the group drawn for each PIN.
fn store(groups: &[i64]) -> MemStore {
    let store = MemStore::new();
    for id in 1..=STORED {
        let group = groups[(id as usize - 1) % groups.len()];
        store.insert(PinRecord::new(id).with_prop(GROUP.0, group));
    }
    store
}

fn listed(ids: &[u64]) -> QueryVar {
    SimpleVar::default()
        .source(SourceSpec::Ids {
            ids: ids.iter().copied().map(PinId).collect(),
        })
        .into()
}

fn run(ctx: &QueryCtx, var: &QueryVar) -> Vec<Vec<Option<u64>>> {
    Cursor::open(ctx, var)
        .unwrap()
        .map(|row| {
            row.unwrap()
                .iter()
                .map(|handle| handle.id().map(|id| id.0))
                .collect()
        })
        .collect()
}

fn stored(ids: &[u64]) -> BTreeSet<u64> {
    ids.iter().copied().filter(|id| (1..=STORED).contains(id)).collect()
}

fn arb_ids() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..=50, 0..30)
}

fn arb_kind() -> impl Strategy<Value = SetOpKind> {
    prop_oneof![
        Just(SetOpKind::Union),
        Just(SetOpKind::Intersect),
        Just(SetOpKind::Except),
    ]
}

proptest! {
    #[test]
    fn set_operations_match_a_set_model(
        kind in arb_kind(),
        inputs in prop::collection::vec(arb_ids(), 2..4),
    ) {
        // Except takes exactly two inputs.
        let inputs = if kind == SetOpKind::Except { &inputs[..2] } else { &inputs[..] };
        let ctx = QueryCtx::new(Arc::new(store(&[0])));
        let var = QueryVar::set_op(kind, inputs.iter().map(|ids| listed(ids)).collect());
        let got: Vec<u64> = run(&ctx, &var).into_iter().map(|row| row[0].unwrap()).collect();

        let sets: Vec<BTreeSet<u64>> = inputs.iter().map(|ids| stored(ids)).collect();
        let expected: BTreeSet<u64> = match kind {
            SetOpKind::Union => sets.iter().flatten().copied().collect(),
            SetOpKind::Intersect => sets[0]
                .iter()
                .copied()
                .filter(|id| sets[1..].iter().all(|set| set.contains(id)))
                .collect(),
            SetOpKind::Except => sets[0].difference(&sets[1]).copied().collect(),
        };
        prop_assert_eq!(got, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn equi_join_matches_nested_pairs(
        groups in prop::collection::vec(0i64..4, 1..8),
        left in arb_ids(),
        right in arb_ids(),
    ) {
        let ctx = QueryCtx::new(Arc::new(store(&groups)));
        let left = stored(&left);
        let right = stored(&right);
        let as_vec = |set: &BTreeSet<u64>| set.iter().copied().collect::<Vec<_>>();
        let var = QueryVar::join(
            JoinKind::Inner,
            listed(&as_vec(&left)),
            listed(&as_vec(&right)),
            vec![JoinCond::new(KeyRef::Prop(GROUP), KeyRef::Prop(GROUP))],
        );
        let mut got = run(&ctx, &var);
        got.sort();

        let group_of = |id: u64| groups[(id as usize - 1) % groups.len()];
        let mut expected: Vec<Vec<Option<u64>>> = left
            .iter()
            .flat_map(|l| {
                right
                    .iter()
                    .filter(move |r| group_of(**r) == group_of(*l))
                    .map(move |r| vec![Some(*l), Some(*r)])
            })
            .collect();
        expected.sort();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn semi_join_emits_one_left_row_per_matching_key(
        groups in prop::collection::vec(0i64..4, 1..8),
        left in arb_ids(),
        right in arb_ids(),
    ) {
        let ctx = QueryCtx::new(Arc::new(store(&groups)));
        let left = stored(&left);
        let right = stored(&right);
        let as_vec = |set: &BTreeSet<u64>| set.iter().copied().collect::<Vec<_>>();
        let var = QueryVar::join(
            JoinKind::Semi,
            listed(&as_vec(&left)),
            listed(&as_vec(&right)),
            vec![JoinCond::new(KeyRef::Prop(GROUP), KeyRef::Prop(GROUP))],
        );
        let rows: Vec<u64> = run(&ctx, &var).into_iter().map(|row| row[0].unwrap()).collect();

        let group_of = |id: u64| groups[(id as usize - 1) % groups.len()];
        let right_groups: BTreeSet<i64> = right.iter().map(|id| group_of(*id)).collect();
        let expected: BTreeSet<i64> = left
            .iter()
            .map(|id| group_of(*id))
            .filter(|group| right_groups.contains(group))
            .collect();
        let got: BTreeSet<i64> = rows.iter().map(|id| group_of(*id)).collect();
        prop_assert_eq!(rows.len(), expected.len());
        prop_assert!(rows.iter().all(|id| left.contains(id)));
        prop_assert_eq!(got, expected);
    }
}

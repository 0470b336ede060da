use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use pinstore::query::op::{JoinCond, JoinKind, KeyRef, PathSeg, SetOpKind};
use pinstore::query::{
    BuildCtx, CmpOp, Cursor, Expr, Operand, QueryConfig, QueryCtx, QueryVar, Session, SimpleVar,
    SourceSpec,
};
use pinstore::storage::{KeyRange, MemStore, PinRecord};
use pinstore::types::ClassId;
use pinstore::{PinError, PinHandle, PinId, PropId, Value};

const AUTHOR: u32 = 1;
const BOOK: u32 = 2;

const NAME: PropId = PropId(1);
const WRITTEN_BY: PropId = PropId(5);
const YEAR: PropId = PropId(6);
const TITLE: PropId = PropId(7);
const SEQUEL: PropId = PropId(8);

/// Three authors and six books; author 3 wrote nothing and book 15 is
/// hidden from every reader by its ACL.
fn library() -> MemStore {
    let store = MemStore::new().with_index(YEAR.0);
    for (id, name) in [(1u64, "Le Guin"), (2, "Lem"), (3, "Tiptree")] {
        store.insert(PinRecord::new(id).with_class(AUTHOR).with_prop(NAME.0, name));
    }
    let books: [(u64, u64, i64, &str); 6] = [
        (10, 1, 1969, "The Left Hand of Darkness"),
        (11, 1, 1974, "The Dispossessed"),
        (12, 2, 1961, "Solaris"),
        (13, 2, 1964, "The Invincible"),
        (14, 2, 1986, "Fiasco"),
        (15, 1, 2000, "The Telling"),
    ];
    for (id, author, year, title) in books {
        let mut record = PinRecord::new(id)
            .with_class(BOOK)
            .with_prop(WRITTEN_BY.0, PinId(author))
            .with_prop(YEAR.0, year)
            .with_prop(TITLE.0, title);
        if id == 12 || id == 13 {
            record = record.with_prop(SEQUEL.0, PinId(id + 1));
        }
        if id == 15 {
            record = record.denied();
        }
        store.insert(record);
    }
    store
}

fn ctx() -> QueryCtx {
    QueryCtx::new(Arc::new(library()))
}

fn class(id: u32) -> SimpleVar {
    SimpleVar::default().source(SourceSpec::Class { class: ClassId(id) })
}

fn slot_ids(row: &[PinHandle]) -> Vec<Option<u64>> {
    row.iter().map(|handle| handle.id().map(|id| id.0)).collect()
}

fn collect(ctx: &QueryCtx, var: &QueryVar) -> Vec<Vec<PinHandle>> {
    Cursor::open(ctx, var)
        .unwrap()
        .map(|row| row.unwrap())
        .collect()
}

#[test]
fn indexed_year_range_returns_titles() {
    let var: QueryVar = class(BOOK)
        .index_cond(
            YEAR,
            KeyRange::new(Bound::Included(Value::Int(1960)), Bound::Excluded(Value::Int(1970))),
        )
        .props([TITLE])
        .into();
    let mut titles: Vec<String> = collect(&ctx(), &var)
        .iter()
        .map(|row| match row[0].prop(TITLE) {
            Some(Value::String(title)) => title.clone(),
            other => panic!("unexpected title {other:?}"),
        })
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["Solaris", "The Invincible", "The Left Hand of Darkness"]);
}

#[test]
fn acl_denied_pin_is_skipped_not_fatal() {
    let var: QueryVar = class(BOOK).props([YEAR]).into();
    let ids: Vec<u64> = collect(&ctx(), &var)
        .iter()
        .map(|row| row[0].id().unwrap().0)
        .collect();
    assert_eq!(ids, vec![10, 11, 12, 13, 14]);
}

fn ids_of(ctx: &QueryCtx, var: &QueryVar) -> Vec<u64> {
    collect(ctx, var).iter().map(|row| row[0].id().unwrap().0).collect()
}

#[test]
fn acl_applies_to_plain_class_scans() {
    let var: QueryVar = class(BOOK).into();
    assert_eq!(ids_of(&ctx(), &var), vec![10, 11, 12, 13, 14]);

    let store = library();
    store.set_denied(PinId(2), true).unwrap();
    let ctx = QueryCtx::new(Arc::new(store));
    assert_eq!(ids_of(&ctx, &class(AUTHOR).into()), vec![1, 3]);
    let full: QueryVar = SimpleVar::default().into();
    let all = ids_of(&ctx, &full);
    assert!(!all.contains(&2) && !all.contains(&15), "{all:?}");
}

#[test]
fn set_operations_drop_denied_pins() {
    let union = QueryVar::set_op(SetOpKind::Union, vec![class(AUTHOR).into(), class(BOOK).into()]);
    assert_eq!(ids_of(&ctx(), &union), vec![1, 2, 3, 10, 11, 12, 13, 14]);
    let listed: QueryVar = SimpleVar::default()
        .source(SourceSpec::Ids { ids: vec![PinId(14), PinId(15)] })
        .into();
    let intersect = QueryVar::set_op(SetOpKind::Intersect, vec![class(BOOK).into(), listed]);
    assert_eq!(ids_of(&ctx(), &intersect), vec![14]);
}

#[test]
fn skip_passes_over_denied_pins_without_counting_them() {
    let var: QueryVar = class(BOOK).into();
    let mut cursor = Cursor::open(&ctx(), &var).unwrap();
    assert_eq!(cursor.skip_rows(4).unwrap(), 4);
    let rest: Vec<u64> = cursor.map(|row| row.unwrap()[0].id().unwrap().0).collect();
    assert_eq!(rest, vec![14]);

    let mut counted = Cursor::open(&ctx(), &var).unwrap();
    assert_eq!(counted.count_rows(100).unwrap(), 5);
}

#[test]
fn inner_join_pairs_books_with_authors() {
    let var = QueryVar::join(
        JoinKind::Inner,
        class(BOOK).props([TITLE]).into(),
        class(AUTHOR).props([NAME]).into(),
        vec![JoinCond::new(KeyRef::Prop(WRITTEN_BY), KeyRef::Id)],
    );
    let rows = collect(&ctx(), &var);
    let pairs: BTreeSet<Vec<Option<u64>>> = rows.iter().map(|row| slot_ids(row)).collect();
    let expected: BTreeSet<Vec<Option<u64>>> = [(10, 1), (11, 1), (12, 2), (13, 2), (14, 2)]
        .into_iter()
        .map(|(book, author)| vec![Some(book), Some(author)])
        .collect();
    assert_eq!(pairs, expected);
    for row in &rows {
        assert!(row[0].prop(TITLE).is_some());
        assert!(row[1].prop(NAME).is_some());
    }
}

#[test]
fn left_outer_join_keeps_authors_without_books() {
    let var = QueryVar::join(
        JoinKind::LeftOuter,
        class(AUTHOR).into(),
        class(BOOK).props([TITLE]).into(),
        vec![JoinCond::new(KeyRef::Id, KeyRef::Prop(WRITTEN_BY))],
    );
    let rows: BTreeSet<Vec<Option<u64>>> =
        collect(&ctx(), &var).iter().map(|row| slot_ids(row)).collect();
    assert!(rows.contains(&vec![Some(3), None]));
    assert!(rows.contains(&vec![Some(2), Some(14)]));
    assert_eq!(rows.len(), 6);
}

#[test]
fn semi_join_finds_prolific_authors() {
    let recent: QueryVar = class(BOOK)
        .filter(Expr::prop_cmp(0, YEAR, CmpOp::Ge, 1970i64))
        .into();
    let var = QueryVar::join(
        JoinKind::Semi,
        class(AUTHOR).into(),
        recent,
        vec![JoinCond::new(KeyRef::Id, KeyRef::Prop(WRITTEN_BY))],
    );
    let ids: Vec<Option<u64>> = collect(&ctx(), &var).iter().map(|row| row[0].id().map(|id| id.0)).collect();
    assert_eq!(ids, vec![Some(1), Some(2)]);
}

#[test]
fn except_removes_recent_books() {
    let recent: QueryVar = class(BOOK)
        .filter(Expr::prop_cmp(0, YEAR, CmpOp::Ge, 1970i64))
        .into();
    let var = QueryVar::set_op(SetOpKind::Except, vec![class(BOOK).props([YEAR]).into(), recent]);
    let ids: Vec<u64> = collect(&ctx(), &var).iter().map(|row| row[0].id().unwrap().0).collect();
    assert_eq!(ids, vec![10, 12, 13]);
}

#[test]
fn sequel_chain_follows_reference_path() {
    let var: QueryVar = SimpleVar::default()
        .source(SourceSpec::Ids { ids: vec![PinId(12)] })
        .path(PathSeg::new(vec![SEQUEL], 1, 3))
        .props([TITLE])
        .into();
    let titles: Vec<Value> = collect(&ctx(), &var)
        .iter()
        .filter_map(|row| row[0].prop(TITLE).cloned())
        .collect();
    assert_eq!(
        titles,
        vec![Value::from("The Invincible"), Value::from("Fiasco")]
    );
}

#[test]
fn theta_join_compares_years_across_slots() {
    let older_than_solaris = Expr::Cmp {
        op: CmpOp::Lt,
        lhs: Operand::Prop { slot: 0, prop: YEAR },
        rhs: Operand::Prop { slot: 1, prop: YEAR },
        nocase: false,
    };
    let solaris: QueryVar = SimpleVar::default()
        .source(SourceSpec::Ids { ids: vec![PinId(12)] })
        .into();
    let var = QueryVar::join(JoinKind::Inner, solaris, class(BOOK).props([YEAR]).into(), Vec::new())
        .with_join_predicate(older_than_solaris);
    let later: BTreeSet<u64> = collect(&ctx(), &var)
        .iter()
        .map(|row| row[1].id().unwrap().0)
        .collect();
    assert_eq!(later, BTreeSet::from([10, 11, 13, 14]));
}

#[test]
fn param_source_feeds_reference_list() {
    let ctx = QueryCtx::builder(Arc::new(library()))
        .param(vec![Value::Ref(PinId(14)), Value::Ref(PinId(10)), Value::Ref(PinId(99))])
        .build();
    let var: QueryVar = SimpleVar::default()
        .source(SourceSpec::Param { index: 0 })
        .props([YEAR])
        .into();
    let mut years: Vec<Value> = collect(&ctx, &var)
        .iter()
        .map(|row| row[0].prop(YEAR).cloned().unwrap())
        .collect();
    years.sort_by_key(|value| match value {
        Value::Int(year) => *year,
        _ => 0,
    });
    assert_eq!(years, vec![Value::Int(1969), Value::Int(1986)]);
}

#[test]
fn json_query_matches_built_query() {
    let text = r#"{
        "var": "simple",
        "sources": [{"source": "class", "class": 2}],
        "predicate": {"contains": {"operand": {"prop": {"slot": 0, "prop": 7}}, "needle": "the"}}
    }"#;
    let parsed: QueryVar = serde_json::from_str(text).unwrap();
    let built: QueryVar = class(BOOK)
        .filter(Expr::Contains {
            operand: Operand::Prop { slot: 0, prop: TITLE },
            needle: "the".into(),
        })
        .into();
    assert_eq!(parsed, built);
    let ids: Vec<u64> = collect(&ctx(), &parsed).iter().map(|row| row[0].id().unwrap().0).collect();
    assert_eq!(ids, vec![10, 11, 13]);
}

#[test]
fn explain_fingerprint_is_stable_across_literals() {
    let plan = |year: i64| {
        let var: QueryVar = class(BOOK).filter(Expr::prop_eq(0, YEAR, year)).into();
        BuildCtx::new(ctx()).build(&var).unwrap().explain()
    };
    let a = plan(1961);
    let b = plan(1986);
    assert_ne!(a.render(), b.render());
    assert_eq!(a.render_with(true), b.render_with(true));
    assert_eq!(a.fingerprint(), b.fingerprint());
}

#[test]
fn operator_budget_from_config() {
    let ctx = QueryCtx::builder(Arc::new(library()))
        .config(QueryConfig::default().with_max_operators(1))
        .build();
    let var = QueryVar::set_op(SetOpKind::Union, vec![class(BOOK).into(), class(AUTHOR).into()]);
    assert!(matches!(
        Cursor::open(&ctx, &var),
        Err(PinError::TooManyOperators { limit: 1 })
    ));
}

#[test]
fn session_abort_stops_a_running_cursor() {
    let session = Session::new(7);
    let ctx = QueryCtx::builder(Arc::new(library()))
        .session(session)
        .config(QueryConfig::default().with_abort_poll_interval(1))
        .build();
    let var: QueryVar = class(BOOK).props([YEAR]).into();
    let mut cursor = Cursor::open(&ctx, &var).unwrap();
    assert!(cursor.next().unwrap().is_ok());
    cursor.abort_flag().store(true, Ordering::Relaxed);
    assert!(matches!(cursor.next(), Some(Err(PinError::Aborted))));
    assert!(cursor.next().is_none());
}

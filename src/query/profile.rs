use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Accumulated time and call count for one operator kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpTiming {
    /// Total nanoseconds spent inside `next`.
    pub ns: u64,
    /// Number of `next` calls.
    pub count: u64,
}

/// A snapshot of per-operator execution counters.
///
/// Profiling is enabled via the `PINSTORE_PROFILE` environment variable.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryProfileSnapshot {
    /// Plan construction.
    pub build: OpTiming,
    /// Scan leaves.
    pub scan: OpTiming,
    /// Load operators.
    pub load: OpTiming,
    /// Filter operators.
    pub filter: OpTiming,
    /// Sort operators.
    pub sort: OpTiming,
    /// Set-operation merges.
    pub merge: OpTiming,
    /// Merge joins.
    pub merge_join: OpTiming,
    /// Hash joins.
    pub hash_join: OpTiming,
    /// Nested-loop joins.
    pub nested_loop: OpTiming,
    /// Path traversals.
    pub path: OpTiming,
}

#[derive(Default)]
struct Counter {
    ns: AtomicU64,
    count: AtomicU64,
}

const KINDS: usize = 10;

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<[Counter; KINDS]> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("PINSTORE_PROFILE").is_some())
}

fn counters() -> Option<&'static [Counter; KINDS]> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(Default::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

#[derive(Copy, Clone)]
pub(crate) enum QueryProfileKind {
    Build,
    Scan,
    Load,
    Filter,
    Sort,
    Merge,
    MergeJoin,
    HashJoin,
    NestedLoop,
    Path,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let counter = &counters[kind as usize];
    counter.ns.fetch_add(nanos, Ordering::Relaxed);
    counter.count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of the operator counters.
///
/// Returns `None` when `PINSTORE_PROFILE` is unset. With `reset` the
/// counters are zeroed as they are read.
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |kind: QueryProfileKind| {
        let counter = &counters[kind as usize];
        if reset {
            OpTiming {
                ns: counter.ns.swap(0, Ordering::Relaxed),
                count: counter.count.swap(0, Ordering::Relaxed),
            }
        } else {
            OpTiming {
                ns: counter.ns.load(Ordering::Relaxed),
                count: counter.count.load(Ordering::Relaxed),
            }
        }
    };
    Some(QueryProfileSnapshot {
        build: load(QueryProfileKind::Build),
        scan: load(QueryProfileKind::Scan),
        load: load(QueryProfileKind::Load),
        filter: load(QueryProfileKind::Filter),
        sort: load(QueryProfileKind::Sort),
        merge: load(QueryProfileKind::Merge),
        merge_join: load(QueryProfileKind::MergeJoin),
        hash_join: load(QueryProfileKind::HashJoin),
        nested_loop: load(QueryProfileKind::NestedLoop),
        path: load(QueryProfileKind::Path),
    })
}

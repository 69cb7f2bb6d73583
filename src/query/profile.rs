use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use serde::Serialize;

/// A snapshot of optimizer and execution profiling metrics.
///
/// Profiling is enabled via the `SYLVA_PROFILE` environment variable and
/// tracks time spent in each phase of turning a plan into results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryProfileSnapshot {
    /// Total nanoseconds spent in rewrite passes.
    pub rewrite_ns: u64,
    /// Number of rewrite pipelines run.
    pub rewrite_count: u64,
    /// Total nanoseconds spent in projection analysis.
    pub projection_ns: u64,
    /// Number of projection analyses.
    pub projection_count: u64,
    /// Total nanoseconds spent lowering plans into operators.
    pub compile_ns: u64,
    /// Number of compilations.
    pub compile_count: u64,
    /// Total nanoseconds spent pulling result rows.
    pub execute_ns: u64,
    /// Number of query evaluations.
    pub execute_count: u64,
}

#[derive(Default)]
struct QueryProfileCounters {
    rewrite_ns: AtomicU64,
    rewrite_count: AtomicU64,
    projection_ns: AtomicU64,
    projection_count: AtomicU64,
    compile_ns: AtomicU64,
    compile_count: AtomicU64,
    execute_ns: AtomicU64,
    execute_count: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<QueryProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("SYLVA_PROFILE").is_some())
}

fn counters() -> Option<&'static QueryProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(QueryProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum QueryProfileKind {
    /// Rewrite pipeline (all passes).
    Rewrite,
    /// Projection analysis.
    Projection,
    /// Plan lowering.
    Compile,
    /// Draining a compiled query.
    Execute,
}

pub(crate) fn record_profile_timer(kind: QueryProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    let (ns, count) = match kind {
        QueryProfileKind::Rewrite => (&counters.rewrite_ns, &counters.rewrite_count),
        QueryProfileKind::Projection => (&counters.projection_ns, &counters.projection_count),
        QueryProfileKind::Compile => (&counters.compile_ns, &counters.compile_count),
        QueryProfileKind::Execute => (&counters.execute_ns, &counters.execute_count),
    };
    ns.fetch_add(nanos, Ordering::Relaxed);
    count.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current profiling metrics.
///
/// Returns `None` when profiling is disabled. With `reset` the counters are
/// zeroed as they are read.
///
/// ```no_run
/// use sylva::query::profile::profile_snapshot;
///
/// if let Some(snapshot) = profile_snapshot(true) {
///     println!("rewrites took {}ns", snapshot.rewrite_ns);
/// }
/// ```
pub fn profile_snapshot(reset: bool) -> Option<QueryProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(QueryProfileSnapshot {
        rewrite_ns: load(&counters.rewrite_ns),
        rewrite_count: load(&counters.rewrite_count),
        projection_ns: load(&counters.projection_ns),
        projection_count: load(&counters.projection_count),
        compile_ns: load(&counters.compile_ns),
        compile_count: load(&counters.compile_count),
        execute_ns: load(&counters.execute_ns),
        execute_count: load(&counters.execute_count),
    })
}

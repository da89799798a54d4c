//! # Engine Tests
//!
//! End-to-end scenarios for the execution engine:
//!
//! 1. Diamond graphs - shared dependencies run exactly once, in order
//! 2. Cycle detection - before any user code runs
//! 3. Failure cascade - propagation, skip marking, independent work
//! 4. Transparent aggregate matching by cause type
//! 5. Parallelism - independent tasks share the wall clock
//! 6. Error reports - captured output rides along with failures
//! 7. Abort priority over ordinary failures
//! 8. Clean pass - reverse order, failed-task cleanup, idempotence
//! 9. Scope isolation - args, reset granularity

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taski::{
    async_trait, register_task, ExecutionObserver, Executor, Task, TaskContext, TaskEvent,
    TaskId, TaskState,
};
use thiserror::Error;

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Observer that records task transitions.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, TaskState, TaskState)>>,
    ids: Mutex<HashMap<String, TaskId>>,
}

impl Recorder {
    fn completions(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, current)| *current == TaskState::Completed)
            .map(|(task, _, _)| task.clone())
            .collect()
    }

    fn state_of(&self, task: &str) -> Option<TaskState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _, _)| name == task)
            .map(|(_, _, current)| *current)
    }

    fn position(&self, order: &[String], task: &str) -> usize {
        order
            .iter()
            .position(|t| t == task)
            .unwrap_or_else(|| panic!("{task} never completed"))
    }
}

impl ExecutionObserver for Recorder {
    fn on_task_updated(&self, event: &TaskEvent) {
        self.ids
            .lock()
            .unwrap()
            .insert(event.task.to_string(), event.id);
        self.events.lock().unwrap().push((
            event.task.to_string(),
            event.previous,
            event.current,
        ));
    }
}

// ============================================================================
// S1: DIAMOND
// ============================================================================

static LEAF_RUNS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct Leaf {
    x: i64,
}
register_task!(Leaf, exports = [x]);

#[async_trait]
impl Task for Leaf {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        LEAF_RUNS.fetch_add(1, Ordering::SeqCst);
        self.x = 1;
        Ok(())
    }
}

#[derive(Default)]
struct Lhs {
    v: i64,
}
register_task!(Lhs, exports = [v]);

#[async_trait]
impl Task for Lhs {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.v = ctx.pull::<Leaf>().await?.x;
        Ok(())
    }
}

#[derive(Default)]
struct Rhs {
    v: i64,
}
register_task!(Rhs, exports = [v]);

#[async_trait]
impl Task for Rhs {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.v = ctx.pull::<Leaf>().await?.x;
        Ok(())
    }
}

#[derive(Default)]
struct Diamond {
    total: i64,
}
register_task!(Diamond, exports = [total]);

#[async_trait]
impl Task for Diamond {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (lhs, rhs) = tokio::join!(ctx.pull::<Lhs>(), ctx.pull::<Rhs>());
        self.total = lhs?.v + rhs?.v;
        Ok(())
    }
}

#[test]
fn diamond_runs_shared_dependency_once_in_order() {
    let recorder = Arc::new(Recorder::default());
    let root = Executor::new()
        .workers(4)
        .observer(Arc::clone(&recorder) as Arc<dyn ExecutionObserver>)
        .run::<Diamond>()
        .expect("diamond run succeeds");

    assert_eq!(root.total, 2);
    assert_eq!(LEAF_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.ids.lock().unwrap().len(), 4, "four distinct tasks");

    let order = recorder.completions();
    let leaf = recorder.position(&order, "Leaf");
    let lhs = recorder.position(&order, "Lhs");
    let rhs = recorder.position(&order, "Rhs");
    let diamond = recorder.position(&order, "Diamond");
    assert!(leaf < lhs && leaf < rhs);
    assert!(lhs < diamond && rhs < diamond);
}

// ============================================================================
// S2: CYCLE DETECTION
// ============================================================================

static CYC_RUNS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default, Debug)]
struct CycA {
    v: i64,
}
register_task!(CycA, exports = [v]);

#[async_trait]
impl Task for CycA {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        CYC_RUNS.fetch_add(1, Ordering::SeqCst);
        self.v = ctx.pull::<CycB>().await?.v;
        Ok(())
    }
}

#[derive(Default)]
struct CycB {
    v: i64,
}
register_task!(CycB, exports = [v]);

#[async_trait]
impl Task for CycB {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        CYC_RUNS.fetch_add(1, Ordering::SeqCst);
        self.v = ctx.pull::<CycA>().await?.v;
        Ok(())
    }
}

#[test]
fn cycle_is_reported_before_any_user_code() {
    let error = taski::run::<CycA>().expect_err("cycle must fail");
    let path = error.cycle_path().expect("cycle error expected");

    assert_eq!(path.len(), 3);
    assert_eq!(path.first(), path.last());
    assert!(path.contains(&"CycA".to_string()));
    assert!(path.contains(&"CycB".to_string()));
    assert_eq!(CYC_RUNS.load(Ordering::SeqCst), 0, "no user code may run");
}

// ============================================================================
// S3 + PROPERTIES 5/6: FAILURE CASCADE AND CLEAN PASS
// ============================================================================

static BOOM_CLEANED: AtomicUsize = AtomicUsize::new(0);
static MID_CLEANED: AtomicUsize = AtomicUsize::new(0);
static INDEP_CLEANED: AtomicUsize = AtomicUsize::new(0);
static ROOT_CLEANED: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct SBoom;
register_task!(SBoom);

#[async_trait]
impl Task for SBoom {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        BOOM_CLEANED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SMid;
register_task!(SMid);

#[async_trait]
impl Task for SMid {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<SBoom>().await?;
        Ok(())
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        MID_CLEANED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SIndep;
register_task!(SIndep);

#[async_trait]
impl Task for SIndep {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(())
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        INDEP_CLEANED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default, Debug)]
struct SRoot;
register_task!(SRoot);

#[async_trait]
impl Task for SRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (indep, mid) = tokio::join!(ctx.pull::<SIndep>(), ctx.pull::<SMid>());
        indep?;
        mid?;
        Ok(())
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        ROOT_CLEANED.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn failure_cascades_while_independent_work_completes() {
    let recorder = Arc::new(Recorder::default());
    let error = Executor::new()
        .workers(4)
        .observer(Arc::clone(&recorder) as Arc<dyn ExecutionObserver>)
        .run::<SRoot>()
        .expect_err("root must fail");

    let aggregate = error.as_aggregate().expect("ordinary failures aggregate");
    assert!(aggregate.contains_task::<SBoom>());
    assert!(aggregate.contains_task::<SMid>());
    assert!(aggregate.contains_task::<SRoot>());
    assert!(!aggregate.contains_task::<SIndep>());

    assert_eq!(recorder.state_of("SBoom"), Some(TaskState::Failed));
    assert_eq!(recorder.state_of("SMid"), Some(TaskState::Failed));
    assert_eq!(recorder.state_of("SIndep"), Some(TaskState::Completed));
    assert_eq!(recorder.state_of("SRoot"), Some(TaskState::Failed));

    // Clean pass: every task that started gets its teardown, the failed
    // ones included.
    Executor::new().clean::<SRoot>().expect("cleans collect, not fail");
    assert_eq!(BOOM_CLEANED.load(Ordering::SeqCst), 1);
    assert_eq!(MID_CLEANED.load(Ordering::SeqCst), 1);
    assert_eq!(INDEP_CLEANED.load(Ordering::SeqCst), 1);
    assert_eq!(ROOT_CLEANED.load(Ordering::SeqCst), 1);

    // Idempotence: a second clean is a no-op.
    Executor::new().clean::<SRoot>().expect("second clean is quiet");
    assert_eq!(BOOM_CLEANED.load(Ordering::SeqCst), 1);
    assert_eq!(ROOT_CLEANED.load(Ordering::SeqCst), 1);
}

// ============================================================================
// PROPERTY 5: SKIPPED TASKS NEVER RUN OR CLEAN
// ============================================================================

static SKC_RUNS: AtomicUsize = AtomicUsize::new(0);
static SKC_CLEANS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct SkF;
register_task!(SkF);

#[async_trait]
impl Task for SkF {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        anyhow::bail!("skf down")
    }
}

#[derive(Default)]
struct SkB;
register_task!(SkB);

#[async_trait]
impl Task for SkB {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<SkF>().await?;
        Ok(())
    }
}

#[derive(Default)]
struct SkC;
register_task!(SkC);

#[async_trait]
impl Task for SkC {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        SKC_RUNS.fetch_add(1, Ordering::SeqCst);
        ctx.pull::<SkF>().await?;
        Ok(())
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        SKC_CLEANS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default, Debug)]
struct SkRoot;
register_task!(SkRoot);

#[async_trait]
impl Task for SkRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        // The first pull fails; SkC is never reached dynamically.
        ctx.pull::<SkB>().await?;
        ctx.pull::<SkC>().await?;
        Ok(())
    }
}

#[test]
fn transitive_dependents_that_never_started_are_skipped() {
    let recorder = Arc::new(Recorder::default());
    let error = Executor::new()
        .observer(Arc::clone(&recorder) as Arc<dyn ExecutionObserver>)
        .run::<SkRoot>()
        .expect_err("SkF fails the run");

    assert!(error.as_aggregate().is_some());
    assert_eq!(recorder.state_of("SkC"), Some(TaskState::Skipped));
    assert_eq!(SKC_RUNS.load(Ordering::SeqCst), 0);

    Executor::new().clean::<SkRoot>().expect("clean pass");
    assert_eq!(SKC_CLEANS.load(Ordering::SeqCst), 0, "skipped tasks never clean");
}

// ============================================================================
// S4: TRANSPARENT AGGREGATE MATCH
// ============================================================================

#[derive(Debug, Error)]
#[error("db unreachable")]
struct DbError;

#[derive(Default)]
struct Db;
register_task!(Db);

#[async_trait]
impl Task for Db {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Err(DbError.into())
    }
}

#[derive(Default, Debug)]
struct DbConsumer;
register_task!(DbConsumer);

#[async_trait]
impl Task for DbConsumer {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<Db>().await?;
        Ok(())
    }
}

#[test]
fn aggregate_matches_transparently_by_cause_type() {
    let error = taski::run::<DbConsumer>().expect_err("db fails");

    assert!(error.contains::<DbError>(), "aggregate must match DbError");
    let aggregate = error.as_aggregate().expect("aggregate");
    let found = aggregate.find::<DbError>().expect("entry with DbError");
    assert_eq!(&*found.task, "Db");
    assert!(aggregate.for_task::<Db>().is_some());
}

// ============================================================================
// S5 / PROPERTY 2: PARALLEL WALL TIME
// ============================================================================

const PAR_SLEEP: Duration = Duration::from_millis(120);

#[derive(Default)]
struct ParA;
register_task!(ParA);

#[async_trait]
impl Task for ParA {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        tokio::time::sleep(PAR_SLEEP).await;
        Ok(())
    }
}

#[derive(Default)]
struct ParB;
register_task!(ParB);

#[async_trait]
impl Task for ParB {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        tokio::time::sleep(PAR_SLEEP).await;
        Ok(())
    }
}

#[derive(Default)]
struct ParRoot;
register_task!(ParRoot);

#[async_trait]
impl Task for ParRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (a, b) = tokio::join!(ctx.pull::<ParA>(), ctx.pull::<ParB>());
        a?;
        b?;
        Ok(())
    }
}

#[test]
fn independent_tasks_share_the_wall_clock() {
    let started = Instant::now();
    Executor::new()
        .workers(2)
        .run::<ParRoot>()
        .expect("parallel run succeeds");
    let elapsed = started.elapsed();

    assert!(elapsed >= PAR_SLEEP, "both tasks really slept");
    assert!(
        elapsed < PAR_SLEEP * 2 - Duration::from_millis(40),
        "independent sleeps must overlap, took {:?}",
        elapsed
    );
}

// ============================================================================
// S6: FAILURE REPORTS CARRY CAPTURED OUTPUT
// ============================================================================

#[derive(Default, Debug)]
struct NoisyFail;
register_task!(NoisyFail);

#[async_trait]
impl Task for NoisyFail {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        use std::io::Write;
        writeln!(ctx.out(), "a")?;
        writeln!(ctx.out(), "b")?;
        writeln!(ctx.out(), "c")?;
        anyhow::bail!("noisy failure")
    }
}

#[test]
fn failure_entry_carries_last_output_lines() {
    let error = taski::run::<NoisyFail>().expect_err("task fails");
    let aggregate = error.as_aggregate().expect("aggregate");
    let entry = aggregate.for_task::<NoisyFail>().expect("entry");
    assert_eq!(entry.last_output, vec!["a", "b", "c"]);
}

// ============================================================================
// S7: ABORT PRIORITY
// ============================================================================

#[derive(Default)]
struct AbSlow;
register_task!(AbSlow);

#[async_trait]
impl Task for AbSlow {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        anyhow::bail!("late ordinary failure")
    }
}

#[derive(Default)]
struct AbFast;
register_task!(AbFast);

#[async_trait]
impl Task for AbFast {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Err(taski::abort("stop everything"))
    }
}

#[derive(Default, Debug)]
struct AbRoot;
register_task!(AbRoot);

#[async_trait]
impl Task for AbRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (slow, fast) = tokio::join!(ctx.pull::<AbSlow>(), ctx.pull::<AbFast>());
        slow?;
        fast?;
        Ok(())
    }
}

#[test]
fn abort_outranks_ordinary_failures() {
    let error = Executor::new().workers(4).run::<AbRoot>().expect_err("aborts");
    assert!(error.is_aborted(), "abort must win, got: {error}");
    assert!(error.as_aggregate().is_none());
}

// ============================================================================
// PROPERTY 4: STATIC REACHABILITY DOES NOT EXECUTE
// ============================================================================

static NEVER_RUNS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct NeverPulled;
register_task!(NeverPulled);

#[async_trait]
impl Task for NeverPulled {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        NEVER_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct GuardedRoot;
register_task!(GuardedRoot);

#[async_trait]
impl Task for GuardedRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        if false {
            ctx.pull::<NeverPulled>().await?;
        }
        Ok(())
    }
}

#[test]
fn statically_reachable_but_unpulled_tasks_never_execute() {
    // Conservative analysis: the dead branch still contributes the edge.
    let tree = taski::tree::<GuardedRoot>();
    assert!(tree.contains("NeverPulled"), "tree: {tree}");

    taski::run::<GuardedRoot>().expect("root succeeds");
    assert_eq!(NEVER_RUNS.load(Ordering::SeqCst), 0);
}

// ============================================================================
// TIMEOUT BECOMES ABORT
// ============================================================================

#[derive(Default)]
struct TimeoutTick;
register_task!(TimeoutTick);

#[async_trait]
impl Task for TimeoutTick {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default, Debug)]
struct TimeoutRoot;
register_task!(TimeoutRoot);

#[async_trait]
impl Task for TimeoutRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.pull::<TimeoutTick>().await?;
        }
    }
}

#[test]
fn timeout_surfaces_as_abort() {
    let started = Instant::now();
    let error = Executor::new()
        .timeout(Duration::from_millis(100))
        .run::<TimeoutRoot>()
        .expect_err("times out");
    assert!(error.is_aborted(), "got: {error}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// PROPERTY 12: SCOPE ISOLATION AND RESET GRANULARITY
// ============================================================================

#[derive(Default)]
struct ArgsProbe {
    seen: String,
    root: String,
}
register_task!(ArgsProbe, exports = [seen, root]);

#[async_trait]
impl Task for ArgsProbe {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.seen = ctx
            .args()
            .get_str("flavor")
            .unwrap_or("missing")
            .to_string();
        // The process-level accessors resolve to the same scope.
        let ambient = taski::args().expect("inside a scope");
        assert_eq!(ambient.get_str("flavor"), ctx.args().get_str("flavor"));
        self.root = taski::env().expect("inside a scope").root_task.to_string();
        Ok(())
    }
}

#[test]
fn independent_executions_do_not_share_args() {
    let first = Executor::new()
        .arg("flavor", "one")
        .run::<ArgsProbe>()
        .expect("first run");
    assert_eq!(first.seen, "one");
    assert_eq!(first.root, "ArgsProbe");

    taski::reset::<ArgsProbe>();

    let second = Executor::new()
        .arg("flavor", "two")
        .run::<ArgsProbe>()
        .expect("second run");
    assert_eq!(second.seen, "two");
}

static CACHE_A_RUNS: AtomicUsize = AtomicUsize::new(0);
static CACHE_B_RUNS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct CacheA;
register_task!(CacheA);

#[async_trait]
impl Task for CacheA {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        CACHE_A_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CacheB;
register_task!(CacheB);

#[async_trait]
impl Task for CacheB {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        CACHE_B_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CacheRoot;
register_task!(CacheRoot);

#[async_trait]
impl Task for CacheRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<CacheA>().await?;
        ctx.pull::<CacheB>().await?;
        Ok(())
    }
}

#[test]
fn reset_clears_exactly_one_cached_task() {
    taski::run::<CacheRoot>().expect("first run");
    assert_eq!(CACHE_A_RUNS.load(Ordering::SeqCst), 1);
    assert_eq!(CACHE_B_RUNS.load(Ordering::SeqCst), 1);

    taski::reset::<CacheRoot>();
    taski::reset::<CacheA>();

    taski::run::<CacheRoot>().expect("second run");
    assert_eq!(CACHE_A_RUNS.load(Ordering::SeqCst), 2, "reset task reruns");
    assert_eq!(CACHE_B_RUNS.load(Ordering::SeqCst), 1, "cached task does not");
}

// ============================================================================
// RUN AND CLEAN
// ============================================================================

static RC_CLEANS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct RunCleanRoot;
register_task!(RunCleanRoot);

#[async_trait]
impl Task for RunCleanRoot {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clean(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        RC_CLEANS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn run_and_clean_tears_down_after_success() {
    taski::run_and_clean::<RunCleanRoot>().expect("run and clean");
    assert_eq!(RC_CLEANS.load(Ordering::SeqCst), 1);
}

// ============================================================================
// PROPERTY 7: ERROR DEDUPLICATION ACROSS PATHS
// ============================================================================

#[derive(Default)]
struct DupLeaf;
register_task!(DupLeaf);

#[async_trait]
impl Task for DupLeaf {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        anyhow::bail!("shared failure")
    }
}

#[derive(Default)]
struct DupL;
register_task!(DupL);

#[async_trait]
impl Task for DupL {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<DupLeaf>().await?;
        Ok(())
    }
}

#[derive(Default)]
struct DupR;
register_task!(DupR);

#[async_trait]
impl Task for DupR {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        ctx.pull::<DupLeaf>().await?;
        Ok(())
    }
}

#[derive(Default, Debug)]
struct DupRoot;
register_task!(DupRoot);

#[async_trait]
impl Task for DupRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (l, r) = tokio::join!(ctx.pull::<DupL>(), ctx.pull::<DupR>());
        l?;
        r?;
        Ok(())
    }
}

#[test]
fn a_failure_reached_through_two_paths_is_recorded_once() {
    let error = Executor::new().workers(4).run::<DupRoot>().expect_err("fails");
    let aggregate = error.as_aggregate().expect("aggregate");

    let leaf_id = <DupLeaf as taski::RegisteredTask>::id();
    let leaf_entries = aggregate
        .iter()
        .filter(|failure| failure.id == leaf_id)
        .count();
    assert_eq!(leaf_entries, 1, "one entry per failed task");
    // The leaf, both consumers, and the root: four distinct entries.
    assert_eq!(aggregate.len(), 4);
}

// ============================================================================
// LOCAL RECOVERY
// ============================================================================

#[derive(Default)]
struct FlakyDep;
register_task!(FlakyDep);

#[async_trait]
impl Task for FlakyDep {
    async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
        anyhow::bail!("flaky")
    }
}

#[derive(Default)]
struct RecoveringRoot {
    fallback_used: bool,
}
register_task!(RecoveringRoot, exports = [fallback_used]);

#[async_trait]
impl Task for RecoveringRoot {
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
        self.fallback_used = ctx.pull::<FlakyDep>().await.is_err();
        Ok(())
    }
}

#[test]
fn a_task_may_recover_from_a_failed_dependency() {
    let root = taski::run::<RecoveringRoot>().expect("root recovers and succeeds");
    assert!(root.fallback_used);
}

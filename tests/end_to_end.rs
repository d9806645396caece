//! End-to-end scenarios exercising `PipelinePoolBuilder`/`PipelineBuilder`
//! directly, covering the scenarios not already pinned down as unit tests
//! next to their owning module (`ES1`/`ES5` in `src/pipeline.rs`, `ES3`/
//! `ES4` in `src/queue.rs`).

use std::sync::Arc;

use bmservice::pool::PipelinePoolBuilder;
use bmservice::{BoundedQueue, ConfigError, PipelineBuilder, StageOutcome};

struct NoCtx;

fn plus_one(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
    *out = input + 1;
    Ok(StageOutcome::Produced)
}

fn times_two(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
    *out = input * 2;
    Ok(StageOutcome::Produced)
}

/// ES2: a pool of K=2 pipelines, each running the same two stages as ES1.
/// Pushing 1..=100 through the shared input/output queues must deliver the
/// multiset `{2*(n+1) | 1 <= n <= 100}`, order unconstrained.
#[test]
fn es2_pool_of_two_preserves_multiset_not_order() {
    let input_queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new());
    let mut pool = PipelinePoolBuilder::new(
        2,
        input_queue,
        |i| format!("es2-{i}"),
        |_i| Ok(NoCtx),
    )
    .add_stage("plus_one", |_i, _ctx: &NoCtx| (plus_one, Vec::<i32>::new()))
    .add_stage("times_two", |_i, _ctx: &NoCtx| (times_two, Vec::<i32>::new()))
    .start()
    .expect("pool starts");

    for n in 1..=100 {
        pool.push(n);
    }
    pool.join();

    let mut out = Vec::new();
    while let Some(v) = pool.try_pop() {
        out.push(v);
    }
    out.sort_unstable();

    let mut expected: Vec<i32> = (1..=100).map(|n| 2 * (n + 1)).collect();
    expected.sort_unstable();
    assert_eq!(out, expected);
}

/// ES6: a stage that fails on one specific input still delivers that
/// input's slot downstream, marked `Failed`, in its original position.
#[test]
fn es6_stage_failure_is_delivered_in_order_not_dropped() {
    fn reject_seven(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
        *out = *input;
        if *input == 7 {
            Ok(StageOutcome::Failed)
        } else {
            Ok(StageOutcome::Produced)
        }
    }

    let input_queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new());
    let mut pool = PipelinePoolBuilder::new(1, input_queue, |i| format!("es6-{i}"), |_i| Ok(NoCtx))
        .add_stage("reject_seven", |_i, _ctx: &NoCtx| {
            (reject_seven, Vec::<i32>::new())
        })
        .start()
        .expect("pool starts");

    for n in [5, 6, 7, 8] {
        pool.push(n);
    }
    pool.join();

    let mut out = Vec::new();
    while let Some(v) = pool.try_pop() {
        out.push(v);
    }
    assert_eq!(out, vec![5, 6, 7, 8]);
}

#[test]
fn terminal_stage_resource_queue_rejected_at_the_pool_level() {
    let input_queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new());
    let result = PipelinePoolBuilder::new(1, input_queue, |i| format!("bad-{i}"), |_i| Ok(NoCtx))
        .add_stage("plus_one", |_i, _ctx: &NoCtx| (plus_one, vec![0, 0]))
        .start();
    assert!(matches!(result, Err(ConfigError::TerminalStageHasResourceQueue { .. })));
}

/// Same scenario at the single-`Pipeline` level (no pool), for parity with
/// `ES1`.
#[test]
fn single_pipeline_stage_failure_still_forwards_the_slot() {
    fn reject_seven(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
        *out = *input;
        if *input == 7 {
            Ok(StageOutcome::Failed)
        } else {
            Ok(StageOutcome::Produced)
        }
    }

    let mut pipeline = PipelineBuilder::new(NoCtx, "es6-single")
        .add_stage("reject_seven", reject_seven, vec![])
        .start()
        .expect("start");

    for n in [5, 6, 7, 8] {
        pipeline.push(n);
    }
    pipeline.join();

    let mut out = Vec::new();
    while let Some(v) = pipeline.try_pop() {
        out.push(v);
    }
    assert_eq!(out, vec![5, 6, 7, 8]);
}

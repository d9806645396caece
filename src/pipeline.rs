//! A pipeline composes N sequentially linked stages wired by intermediate
//! queues (spec §4.3).
//!
//! Stage wiring uses a typestate builder whose type parameter tracks the
//! current tail output type, so an `add_stage` call whose input type doesn't
//! match the previous stage's output type is a compile error rather than the
//! original's runtime `dynamic_pointer_cast` check (spec §9's "prefer
//! compile-time generic stages" guidance).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::ConfigError;
use crate::queue::BoundedQueue;
use crate::stage::{Stage, StageOutcome};

/// `Constructed`/`Configured`/`Running` states of spec §4.3 are encoded by
/// `PipelineBuilder` (pre-`start`) vs. `Pipeline` (post-`start`); `Stopping`/
/// `Stopped` are runtime states tracked inside `Pipeline` via the shared
/// `done` flag and the (post-join) empty handle list.
pub struct PipelineBuilder<Ctx, In, Cur> {
    name: String,
    context: Arc<Ctx>,
    done: Arc<AtomicBool>,
    input_queue: Arc<BoundedQueue<In>>,
    tail_work_queue: Arc<BoundedQueue<Cur>>,
    tail_resource_queue: Option<Arc<BoundedQueue<Cur>>>,
    spawners: Vec<Box<dyn FnOnce() -> JoinHandle<()> + Send>>,
}

impl<Ctx, In> PipelineBuilder<Ctx, In, In>
where
    Ctx: Send + Sync + 'static,
    In: Send + 'static,
{
    /// Creates an empty pipeline with a fresh input queue; records context.
    pub fn new(context: Ctx, name: impl Into<String>) -> Self {
        let input_queue = Arc::new(BoundedQueue::new());
        Self {
            name: name.into(),
            context: Arc::new(context),
            done: Arc::new(AtomicBool::new(false)),
            input_queue: input_queue.clone(),
            tail_work_queue: input_queue,
            tail_resource_queue: None,
            spawners: Vec::new(),
        }
    }

    /// Replaces the default input queue. Only valid before any stage is
    /// added (spec §4.3).
    pub fn set_input_queue(mut self, q: Arc<BoundedQueue<In>>) -> Result<Self, ConfigError> {
        if !self.spawners.is_empty() {
            return Err(ConfigError::InputQueueAlreadyWired);
        }
        self.input_queue = q.clone();
        self.tail_work_queue = q;
        Ok(self)
    }
}

impl<Ctx, In, Cur> PipelineBuilder<Ctx, In, Cur> {
    /// Shared context, readable while composing per-pipeline stage closures
    /// (used by `PipelinePoolBuilder` to vary a stage's behavior by device).
    pub fn context(&self) -> &Ctx {
        &self.context
    }
}

impl<Ctx, In, Cur> PipelineBuilder<Ctx, In, Cur>
where
    Ctx: Send + Sync + 'static,
    In: Send + 'static,
    Cur: Send + 'static,
{
    /// Appends a stage. `out_resources`, if non-empty, prefills a resource
    /// queue bounding this stage's in-flight output buffers; the previous
    /// stage's own resource queue (if any) becomes this stage's input
    /// resource queue, so consumed input buffers are recycled upstream.
    pub fn add_stage<Out, F>(
        self,
        stage_name: impl Into<String>,
        func: F,
        out_resources: Vec<Out>,
    ) -> PipelineBuilder<Ctx, In, Out>
    where
        Out: Send + Default + 'static,
        F: Fn(&Cur, &mut Out, &Ctx) -> anyhow::Result<StageOutcome> + Send + Sync + 'static,
    {
        let PipelineBuilder {
            name,
            context,
            done,
            input_queue,
            tail_work_queue,
            tail_resource_queue,
            mut spawners,
        } = self;

        let output_work: Arc<BoundedQueue<Out>> = Arc::new(BoundedQueue::new());
        let output_resource: Option<Arc<BoundedQueue<Out>>> = if out_resources.is_empty() {
            None
        } else {
            let q = Arc::new(BoundedQueue::new());
            for item in out_resources {
                q.push(item);
            }
            Some(q)
        };

        let stage_name = stage_name.into();
        let input_work = tail_work_queue;
        let input_resource = tail_resource_queue;
        let stage_ctx = context.clone();
        let stage_done = done.clone();
        let stage_output_work = output_work.clone();
        let stage_output_resource = output_resource.clone();

        spawners.push(Box::new(move || {
            let boxed_func: Box<
                dyn Fn(&Cur, &mut Out, &Ctx) -> anyhow::Result<StageOutcome> + Send + Sync,
            > = Box::new(func);
            Stage::new(
                stage_name,
                boxed_func,
                input_work,
                input_resource,
                stage_output_resource,
                stage_output_work,
                stage_ctx,
                stage_done,
            )
            .spawn()
        }));

        PipelineBuilder {
            name,
            context,
            done,
            input_queue,
            tail_work_queue: output_work,
            tail_resource_queue: output_resource,
            spawners,
        }
    }

    /// Validates that the final stage has no output resource queue, then
    /// spawns one OS thread per stage.
    pub fn start(self) -> Result<Pipeline<Ctx, In, Cur>, ConfigError> {
        if self.tail_resource_queue.is_some() {
            return Err(ConfigError::TerminalStageHasResourceQueue { pipeline: self.name });
        }
        let handles = self.spawners.into_iter().map(|spawn| spawn()).collect();
        Ok(Pipeline {
            name: self.name,
            context: self.context,
            done: self.done,
            input_queue: self.input_queue,
            output_queue: self.tail_work_queue,
            handles,
        })
    }
}

/// A running (or stopped) pipeline: head input queue, tail output queue, and
/// one shared `Context`.
pub struct Pipeline<Ctx, In, Out> {
    name: String,
    context: Arc<Ctx>,
    done: Arc<AtomicBool>,
    input_queue: Arc<BoundedQueue<In>>,
    output_queue: Arc<BoundedQueue<Out>>,
    handles: Vec<JoinHandle<()>>,
}

impl<Ctx, In, Out> Pipeline<Ctx, In, Out> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Ctx {
        &self.context
    }

    pub fn context_arc(&self) -> Arc<Ctx> {
        self.context.clone()
    }

    /// Raw handle to the tail output queue. Used by `PipelinePool` to wire a
    /// forwarding thread that fans every constituent pipeline's output into
    /// one shared queue.
    pub(crate) fn output_queue_arc(&self) -> Arc<BoundedQueue<Out>> {
        self.output_queue.clone()
    }

    pub fn push(&self, v: In) {
        self.input_queue.push(v);
    }

    pub fn can_push(&self) -> bool {
        self.input_queue.can_push()
    }

    pub fn try_pop(&self) -> Option<Out> {
        self.output_queue.try_pop()
    }

    pub fn wait_and_pop(&self) -> Option<Out> {
        self.output_queue.wait_and_pop()
    }

    pub fn is_empty(&self) -> bool {
        self.output_queue.is_empty() && self.input_queue.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.done.load(Ordering::Acquire) && self.handles.is_empty()
    }

    /// Raises `done`; joins stage threads. In-flight user work is not
    /// interrupted, only its result is discarded once all threads exit.
    pub fn stop(&mut self) {
        self.done.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Joins the input queue (no more pushes will be accepted as new work);
    /// waits for every stage to drain and exit, cascading the join signal
    /// stage-by-stage; then joins the output queue so a consumer's
    /// `wait_and_pop` reliably returns `None` once drained.
    pub fn join(&mut self) {
        self.input_queue.join();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.done.store(true, Ordering::Release);
        self.output_queue.join();
    }
}

impl<Ctx, In, Out> Drop for Pipeline<Ctx, In, Out> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCtx;

    fn inc(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
        *out = input + 1;
        Ok(StageOutcome::Produced)
    }

    fn double(input: &i32, out: &mut i32, _ctx: &NoCtx) -> anyhow::Result<StageOutcome> {
        *out = input * 2;
        Ok(StageOutcome::Produced)
    }

    #[test]
    fn es1_two_stage_pipeline_preserves_order() {
        let mut pipeline = PipelineBuilder::new(NoCtx, "es1")
            .add_stage("plus_one", inc, vec![])
            .add_stage("times_two", double, vec![])
            .start()
            .expect("start");

        for i in 0..=5 {
            pipeline.push(i);
        }
        pipeline.join();

        let mut out = Vec::new();
        while let Some(v) = pipeline.try_pop() {
            out.push(v);
        }
        assert_eq!(out, vec![2, 4, 6, 8, 10, 12]);
    }

    #[test]
    fn empty_deconstruct_never_starts_a_thread() {
        let builder = PipelineBuilder::new(NoCtx, "es5")
            .add_stage("plus_one", inc, vec![])
            .add_stage("times_two", double, vec![]);
        drop(builder);
    }

    #[test]
    fn terminal_stage_with_resource_queue_is_a_config_error() {
        let result = PipelineBuilder::new(NoCtx, "bad")
            .add_stage("plus_one", inc, vec![0, 0])
            .start();
        assert!(result.is_err());
    }
}

//! `PipelinePool`: K parallel `Pipeline`s sharing one input queue and one
//! output queue, one per device (spec §4.4).
//!
//! Grounded on `BMDevicePool`'s per-device node construction: a failing
//! context initializer leaves that slot absent rather than aborting the
//! whole pool, and the pool carries on with however many devices it could
//! actually bring up. Fan-in is free (every pipeline's first stage already
//! reads from the same shared `BoundedQueue`); fan-out is one lightweight
//! forwarding thread per live pipeline, draining that pipeline's private
//! tail queue into the pool's shared output queue.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::ConfigError;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::queue::BoundedQueue;
use crate::stage::StageOutcome;

/// Composes one `PipelineBuilder` per device slot. `add_stage` is applied to
/// every live slot with a per-index factory, so a stage can read its own
/// pipeline's `Ctx` (e.g. a per-device buffer pool) while building its
/// closure.
pub struct PipelinePoolBuilder<Ctx, In, Cur> {
    slots: Vec<Option<PipelineBuilder<Ctx, In, Cur>>>,
}

impl<Ctx, In> PipelinePoolBuilder<Ctx, In, In>
where
    Ctx: Send + Sync + 'static,
    In: Send + 'static,
{
    /// Builds `k` contexts via `context_init(index)`. A failing initializer
    /// logs a warning and leaves that slot absent; the pool is only a hard
    /// error if *every* slot fails (`ConfigError::NoDevicesAvailable`, raised
    /// from `start`, not here, since later `add_stage` calls still need a
    /// builder to fold over).
    pub fn new(
        k: usize,
        input_queue: Arc<BoundedQueue<In>>,
        name_fn: impl Fn(usize) -> String,
        context_init: impl Fn(usize) -> anyhow::Result<Ctx>,
    ) -> Self {
        let slots = (0..k)
            .map(|i| match context_init(i) {
                Ok(ctx) => {
                    match PipelineBuilder::new(ctx, name_fn(i)).set_input_queue(input_queue.clone())
                    {
                        Ok(builder) => Some(builder),
                        Err(err) => {
                            tracing::error!(index = i, error = %err, "unreachable: fresh pipeline builder rejected shared input queue");
                            None
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(index = i, error = %err, "pipeline context init failed; slot left absent");
                    None
                }
            })
            .collect();
        Self { slots }
    }
}

impl<Ctx, In, Cur> PipelinePoolBuilder<Ctx, In, Cur>
where
    Ctx: Send + Sync + 'static,
    In: Send + 'static,
    Cur: Send + 'static,
{
    /// Appends one stage to every live slot. `make_stage(index, ctx)` returns
    /// the per-pipeline closure and its output-resource prefill, letting
    /// e.g. a forward stage size its buffer pool from the device context it
    /// was handed.
    pub fn add_stage<Out, F>(
        self,
        stage_name: impl Into<String>,
        mut make_stage: impl FnMut(usize, &Ctx) -> (F, Vec<Out>),
    ) -> PipelinePoolBuilder<Ctx, In, Out>
    where
        Out: Send + Default + 'static,
        F: Fn(&Cur, &mut Out, &Ctx) -> anyhow::Result<StageOutcome> + Send + Sync + 'static,
    {
        let name = stage_name.into();
        let slots = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.map(|builder| {
                    let (func, out_resources) = make_stage(i, builder.context());
                    builder.add_stage(name.clone(), func, out_resources)
                })
            })
            .collect();
        PipelinePoolBuilder { slots }
    }

    /// Starts every live slot's pipeline and wires one forwarding thread per
    /// pipeline into a freshly created shared output queue. Errors if every
    /// slot failed context init, or if any live slot fails to start (e.g. a
    /// terminal stage left an output-resource queue, spec §4.3).
    pub fn start(self) -> Result<PipelinePool<Ctx, In, Cur>, ConfigError> {
        let mut pipelines = Vec::with_capacity(self.slots.len());
        for slot in self.slots {
            match slot {
                Some(builder) => pipelines.push(Some(builder.start()?)),
                None => pipelines.push(None),
            }
        }

        if pipelines.iter().all(Option::is_none) {
            return Err(ConfigError::NoDevicesAvailable);
        }

        let output_queue: Arc<BoundedQueue<Cur>> = Arc::new(BoundedQueue::new());
        let mut forwarders = Vec::new();
        for pipeline in pipelines.iter().flatten() {
            let src = pipeline.output_queue_arc();
            let dst = output_queue.clone();
            forwarders.push(std::thread::spawn(move || {
                while let Some(item) = src.wait_and_pop() {
                    dst.push(item);
                }
            }));
        }

        Ok(PipelinePool {
            pipelines,
            output_queue,
            forwarders,
        })
    }
}

/// K running pipelines fanned in on one input queue (wired in at builder
/// construction) and fanned out on one shared output queue.
pub struct PipelinePool<Ctx, In, Out> {
    pipelines: Vec<Option<Pipeline<Ctx, In, Out>>>,
    output_queue: Arc<BoundedQueue<Out>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl<Ctx, In, Out> PipelinePool<Ctx, In, Out> {
    /// Number of pipelines that actually started (<= the requested `k`).
    pub fn device_num(&self) -> usize {
        self.pipelines.iter().filter(|p| p.is_some()).count()
    }

    pub fn get_pipeline_context(&self, index: usize) -> Option<&Ctx> {
        self.pipelines.get(index)?.as_ref().map(|p| p.context())
    }

    pub fn can_push(&self) -> bool {
        self.pipelines
            .iter()
            .flatten()
            .next()
            .map(Pipeline::can_push)
            .unwrap_or(false)
    }

    /// Pushes into the shared input queue via whichever pipeline is still
    /// live (every live pipeline's first stage reads the very same queue).
    pub fn push(&self, v: In) {
        if let Some(first) = self.pipelines.iter().flatten().next() {
            first.push(v);
        }
    }

    pub fn try_pop(&self) -> Option<Out> {
        self.output_queue.try_pop()
    }

    pub fn wait_and_pop(&self) -> Option<Out> {
        self.output_queue.wait_and_pop()
    }

    pub fn is_empty(&self) -> bool {
        self.output_queue.is_empty() && self.pipelines.iter().flatten().all(Pipeline::is_empty)
    }

    pub fn all_stopped(&self) -> bool {
        self.pipelines
            .iter()
            .flatten()
            .all(Pipeline::is_stopped)
    }

    /// Stops the given pipeline indices, or every pipeline if `None`.
    pub fn stop(&mut self, indices: Option<&[usize]>) {
        match indices {
            Some(indices) => {
                for &i in indices {
                    if let Some(Some(p)) = self.pipelines.get_mut(i) {
                        p.stop();
                    }
                }
            }
            None => {
                for p in self.pipelines.iter_mut().flatten() {
                    p.stop();
                }
            }
        }
    }

    /// Joins every constituent pipeline (cascading each one's own input
    /// queue join), then the forwarding threads (which exit once their
    /// source pipeline's output queue drains), then the shared output queue.
    pub fn join(&mut self) {
        for p in self.pipelines.iter_mut().flatten() {
            p.join();
        }
        for handle in self.forwarders.drain(..) {
            let _ = handle.join();
        }
        self.output_queue.join();
    }
}

impl<Ctx, In, Out> Drop for PipelinePool<Ctx, In, Out> {
    fn drop(&mut self) {
        self.stop(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeviceCtx {
        id: u32,
    }

    fn scale(input: &i32, out: &mut i32, ctx: &DeviceCtx) -> anyhow::Result<StageOutcome> {
        *out = input * ctx.id as i32;
        Ok(StageOutcome::Produced)
    }

    #[test]
    fn pool_fans_in_and_out_across_devices() {
        let input_queue = Arc::new(BoundedQueue::new());
        let mut pool = PipelinePoolBuilder::new(
            3,
            input_queue,
            |i| format!("device-{i}"),
            |i| Ok(DeviceCtx { id: i as u32 + 1 }),
        )
        .add_stage("scale", |_, _| (scale, Vec::<i32>::new()))
        .start()
        .expect("start");

        assert_eq!(pool.device_num(), 3);
        for i in 0..9 {
            pool.push(i);
        }
        pool.join();

        let mut out = Vec::new();
        while let Some(v) = pool.try_pop() {
            out.push(v);
        }
        assert_eq!(out.len(), 9);
        assert!(pool.all_stopped());
    }

    #[test]
    fn failing_context_leaves_pool_partially_built() {
        let input_queue = Arc::new(BoundedQueue::new());
        let pool = PipelinePoolBuilder::<DeviceCtx, i32, i32>::new(
            2,
            input_queue,
            |i| format!("device-{i}"),
            |i| {
                if i == 1 {
                    anyhow::bail!("device 1 unavailable");
                }
                Ok(DeviceCtx { id: i as u32 })
            },
        )
        .add_stage("scale", |_, _| (scale, Vec::<i32>::new()))
        .start()
        .expect("start");

        assert_eq!(pool.device_num(), 1);
        assert!(pool.get_pipeline_context(1).is_none());
    }

    #[test]
    fn all_contexts_failing_is_no_devices_available() {
        let input_queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new());
        let result = PipelinePoolBuilder::<DeviceCtx, i32, i32>::new(
            2,
            input_queue,
            |i| format!("device-{i}"),
            |_| anyhow::bail!("no hardware"),
        )
        .add_stage("scale", |_, _| (scale, Vec::<i32>::new()))
        .start();

        assert!(matches!(result, Err(ConfigError::NoDevicesAvailable)));
    }
}

//! `DeviceRunner`: the pre → forward → post `PipelinePool` specialization
//! every model-serving use of this engine actually builds (spec §4.6),
//! grounded on `BMDevicePool<InType, OutType>`.
//!
//! Each stage double-buffers its output (`out_resources` prefilled with 2
//! buffers, as the original's `createPreProcessOutput`/`createForwardOutput`
//! do) so a stage can fill one buffer while the previous one drains
//! downstream. `forward` pads a partial batch up to the network's static
//! batch size before launching and resets the shape afterward.

use std::sync::{Arc, Mutex};

use crate::device::context::DeviceContext;
use crate::device::runtime::DeviceRuntime;
use crate::error::ConfigError;
use crate::pool::{PipelinePool, PipelinePoolBuilder};
use crate::queue::BoundedQueue;
use crate::stage::StageOutcome;
use crate::status::{ProcessStatInfo, ProcessStatus};
use crate::tensor::{Tensor, TensorVec};

/// User-supplied preprocessing: fills `pre_tensors` from `input`. Returns
/// `Ok(false)` for an invalid-but-not-fatal input (e.g. a corrupt image);
/// an `Err` is treated as stage-fatal (spec §7).
pub trait PreProcess<In>: Fn(&In, &mut TensorVec, &DeviceContext) -> anyhow::Result<bool> + Send + Sync {}
impl<In, F> PreProcess<In> for F where F: Fn(&In, &mut TensorVec, &DeviceContext) -> anyhow::Result<bool> + Send + Sync {}

/// User-supplied postprocessing: turns the network's raw output tensors
/// into the caller's `Out` type.
pub trait PostProcess<In, Out>:
    Fn(&In, &TensorVec, &mut Out, &DeviceContext) -> anyhow::Result<bool> + Send + Sync
{
}
impl<In, Out, F> PostProcess<In, Out> for F where
    F: Fn(&In, &TensorVec, &mut Out, &DeviceContext) -> anyhow::Result<bool> + Send + Sync
{
}

#[derive(Clone)]
pub struct PreOut<In: Clone> {
    pub input: In,
    pub pre_tensors: TensorVec,
    pub status: ProcessStatus,
}

impl<In: Clone + Default> Default for PreOut<In> {
    fn default() -> Self {
        Self {
            input: In::default(),
            pre_tensors: TensorVec::new(),
            status: ProcessStatus::new(0),
        }
    }
}

#[derive(Clone)]
pub struct ForwardOut<In: Clone> {
    pub input: In,
    pub forward_tensors: TensorVec,
    pub status: ProcessStatus,
}

impl<In: Clone + Default> Default for ForwardOut<In> {
    fn default() -> Self {
        Self {
            input: In::default(),
            forward_tensors: TensorVec::new(),
            status: ProcessStatus::new(0),
        }
    }
}

pub struct PostOut<In, Out> {
    pub input: In,
    pub output: Out,
    pub status: ProcessStatus,
}

impl<In: Default, Out: Default> Default for PostOut<In, Out> {
    fn default() -> Self {
        Self {
            input: In::default(),
            output: Out::default(),
            status: ProcessStatus::new(0),
        }
    }
}

/// Number of in-flight output buffers double-buffered per stage (spec
/// §4.6, matching `createPreProcessOutput`/`createForwardOutput`'s
/// `for(i=0;i<2;i++)`).
const DOUBLE_BUFFER: usize = 2;

/// A running `PipelinePool<DeviceContext, In, PostOut<In, Out>>` wired with
/// exactly the pre/forward/post topology spec §4.6 names, plus the
/// aggregate statistics collector the C ABI's `runner_show_status` reads.
pub struct DeviceRunner<In, Out> {
    pool: PipelinePool<DeviceContext, In, PostOut<In, Out>>,
    stats: Mutex<ProcessStatInfo>,
}

impl<In, Out> DeviceRunner<In, Out>
where
    In: Clone + Default + Send + Sync + 'static,
    Out: Default + Send + 'static,
{
    pub fn new(
        model_name: impl Into<String>,
        device_ids: Vec<u32>,
        runtime: Arc<dyn DeviceRuntime>,
        pre_process: impl PreProcess<In> + Clone + 'static,
        post_process: impl PostProcess<In, Out> + Clone + 'static,
    ) -> Result<Self, ConfigError> {
        if device_ids.is_empty() {
            return Err(ConfigError::NoDevicesAvailable);
        }
        let model_name = model_name.into();
        let device_num = device_ids.len();
        let input_queue = Arc::new(BoundedQueue::with_capacity(device_num * 4));

        let pool = PipelinePoolBuilder::new(
            device_num,
            input_queue,
            {
                let device_ids = device_ids.clone();
                move |i| format!("device-{}", device_ids[i])
            },
            {
                let model_name = model_name.clone();
                let runtime = runtime.clone();
                let device_ids = device_ids.clone();
                move |i| {
                    DeviceContext::new(runtime.clone(), device_ids[i], model_name.clone())
                        .map_err(anyhow::Error::from)
                }
            },
        )
        .add_stage("pre", {
            let pre_process = pre_process.clone();
            move |_i, ctx: &DeviceContext| {
                let pre_process = pre_process.clone();
                let func = move |input: &In, out: &mut PreOut<In>, ctx: &DeviceContext| {
                    out.status = ProcessStatus::new(ctx.device_id);
                    out.status.start();
                    out.input = input.clone();
                    out.status.valid = pre_process(input, &mut out.pre_tensors, ctx)?;
                    out.status.end();
                    Ok(StageOutcome::Produced)
                };
                let out_resources = (0..DOUBLE_BUFFER)
                    .map(|_| PreOut {
                        input: In::default(),
                        pre_tensors: tensors_from_spec(ctx, true),
                        status: ProcessStatus::new(ctx.device_id),
                    })
                    .collect();
                (func, out_resources)
            }
        })
        .add_stage("forward", |_i, ctx: &DeviceContext| {
            let func = move |in_item: &PreOut<In>, out: &mut ForwardOut<In>, ctx: &DeviceContext| {
                out.input = in_item.input.clone();
                out.status = in_item.status.clone();
                if out.status.valid {
                    out.status.start();
                    let batch = ctx.batch_size();
                    let mut padded = in_item.pre_tensors.clone();
                    ctx.apply_in_filters(&mut padded)?;
                    for t in padded.iter_mut() {
                        t.set_batch(batch);
                    }
                    let mut tensors = ctx
                        .runtime()
                        .launch_tensor_ex(ctx.device_id, &ctx.network_name, &padded)
                        .unwrap_or_else(|err| {
                            panic!(
                                "device {} launch failed on network `{}`: {err}",
                                ctx.device_id, ctx.network_name
                            )
                        });
                    for t in tensors.iter_mut() {
                        t.set_batch(batch);
                    }
                    ctx.apply_out_filters(&mut tensors)?;
                    out.forward_tensors = tensors;
                    out.status.end();
                }
                Ok(StageOutcome::Produced)
            };
            let out_resources = (0..DOUBLE_BUFFER)
                .map(|_| ForwardOut {
                    input: In::default(),
                    forward_tensors: tensors_from_spec(ctx, false),
                    status: ProcessStatus::new(ctx.device_id),
                })
                .collect();
            (func, out_resources)
        })
        .add_stage("post", {
            let post_process = post_process.clone();
            move |_i, _ctx: &DeviceContext| {
                let post_process = post_process.clone();
                let func = move |in_item: &ForwardOut<In>, out: &mut PostOut<In, Out>, ctx: &DeviceContext| {
                    out.input = in_item.input.clone();
                    out.status = in_item.status.clone();
                    if out.status.valid {
                        out.status.start();
                        out.status.valid =
                            post_process(&in_item.input, &in_item.forward_tensors, &mut out.output, ctx)?;
                        out.status.end();
                    }
                    Ok(StageOutcome::Produced)
                };
                (func, Vec::new())
            }
        })
        .start()?;

        Ok(Self {
            pool,
            stats: Mutex::new(ProcessStatInfo::new(model_name)),
        })
    }

    pub fn push(&self, input: In) {
        self.pool.push(input);
    }

    pub fn can_push(&self) -> bool {
        self.pool.can_push()
    }

    pub fn try_pop(&self) -> Option<(Out, ProcessStatus)> {
        self.pool.try_pop().map(|post| self.record(post))
    }

    pub fn wait_and_pop(&self) -> Option<(Out, ProcessStatus)> {
        self.pool.wait_and_pop().map(|post| self.record(post))
    }

    fn record(&self, post: PostOut<In, Out>) -> (Out, ProcessStatus) {
        self.stats.lock().unwrap().update(&post.status);
        (post.output, post.status)
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn all_stopped(&self) -> bool {
        self.pool.all_stopped()
    }

    pub fn device_num(&self) -> usize {
        self.pool.device_num()
    }

    pub fn get_pipeline_context(&self, index: usize) -> Option<&DeviceContext> {
        self.pool.get_pipeline_context(index)
    }

    /// Per-stage cumulative durations in microseconds, for the C ABI's
    /// `get_runner_durations` (spec §4.7).
    pub fn durations_micros(&self) -> Vec<u64> {
        self.stats
            .lock()
            .unwrap()
            .per_stage_duration
            .iter()
            .map(|d| d.as_micros() as u64)
            .collect()
    }

    pub fn stop(&mut self, device_index: Option<&[usize]>) {
        self.pool.stop(device_index);
    }

    pub fn join(&mut self) {
        self.pool.join();
    }

    pub fn show_status(&self) {
        self.stats.lock().unwrap().show();
    }
}

fn tensors_from_spec(ctx: &DeviceContext, inputs: bool) -> TensorVec {
    let specs = if inputs {
        &ctx.network.inputs
    } else {
        &ctx.network.outputs
    };
    specs
        .iter()
        .map(|spec| Tensor::new(spec.name.clone(), spec.shape.clone(), spec.dtype))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockRuntime;

    #[derive(Clone, Default)]
    struct Request {
        value: f32,
    }

    #[derive(Default)]
    struct Response {
        value: f32,
    }

    #[test]
    fn runner_processes_one_request_per_device() {
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(MockRuntime::new([0, 1]));
        let mut runner = DeviceRunner::<Request, Response>::new(
            "test-model",
            vec![0, 1],
            runtime,
            |req: &Request, tensors: &mut TensorVec, ctx: &DeviceContext| {
                for t in tensors.iter_mut() {
                    t.scale = req.value;
                }
                let _ = ctx.device_id;
                Ok(true)
            },
            |_req: &Request, _tensors: &TensorVec, out: &mut Response, _ctx: &DeviceContext| {
                out.value = 42.0;
                Ok(true)
            },
        )
        .expect("runner starts");

        assert_eq!(runner.device_num(), 2);
        for _ in 0..4 {
            runner.push(Request { value: 1.0 });
        }
        runner.join();

        let mut results = Vec::new();
        while let Some((resp, status)) = runner.try_pop() {
            assert!(status.valid);
            results.push(resp.value);
        }
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|&v| v == 42.0));
    }

    /// A `launch_tensor_ex` failure is pipeline-fatal (spec §7): the owning
    /// device's pipeline tears itself down rather than forwarding an
    /// invalid-but-alive slot, so no result for it ever reaches `try_pop`.
    #[test]
    fn launch_failure_tears_down_its_pipeline_instead_of_limping_on() {
        let runtime: Arc<dyn DeviceRuntime> =
            Arc::new(MockRuntime::new([0]).with_failing_launch());
        let mut runner = DeviceRunner::<Request, Response>::new(
            "test-model",
            vec![0],
            runtime,
            |_req: &Request, _tensors: &mut TensorVec, _ctx: &DeviceContext| Ok(true),
            |_req: &Request, _tensors: &TensorVec, out: &mut Response, _ctx: &DeviceContext| {
                out.value = 42.0;
                Ok(true)
            },
        )
        .expect("runner starts");

        runner.push(Request { value: 1.0 });
        runner.join();

        assert!(runner.try_pop().is_none());
        assert!(runner.all_stopped());
    }
}

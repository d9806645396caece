//! Small CLI demo wiring a [`bmservice::DeviceRunner`] over the bundled
//! [`bmservice::MockRuntime`], in the spirit of the teacher's clap-based
//! `main.rs`. Not a production inference server — just enough to push a
//! batch of requests through the pre/forward/post pipeline and print the
//! per-request timing `bmservice::ProcessStatus` collects.

use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};

use bmservice::device::DeviceContext;
use bmservice::tensor::{DType, Tensor, TensorVec};
use bmservice::{DeviceRunner, MockRuntime};

#[derive(Parser)]
#[command(name = "bmservice-demo")]
#[command(about = "Runs a batch of mock requests through a multi-device inference pipeline")]
struct Cli {
    /// Model name passed to the mock device runtime.
    #[arg(short, long, default_value = "demo-model")]
    model: String,

    /// Number of mock devices to spread work across.
    #[arg(short, long, default_value_t = 2)]
    devices: u32,

    /// Number of requests to push through the pipeline.
    #[arg(short, long, default_value_t = 8)]
    requests: u32,

    /// Log level, forwarded to `bmservice::logging::init_logging`.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Request {
    id: u32,
    scale: f32,
}

#[derive(Debug, Default)]
struct Response {
    id: u32,
    total: f32,
}

fn pre_process(
    req: &Request,
    tensors: &mut TensorVec,
    _ctx: &DeviceContext,
) -> anyhow::Result<bool> {
    tensors.clear();
    let mut tensor = Tensor::new("input", vec![1, 4], DType::F32);
    tensor.scale = req.scale;
    tensors.push(tensor);
    Ok(true)
}

fn post_process(
    req: &Request,
    tensors: &TensorVec,
    out: &mut Response,
    _ctx: &DeviceContext,
) -> anyhow::Result<bool> {
    out.id = req.id;
    out.total = tensors.iter().map(|t| t.mem_size() as f32 * req.scale).sum();
    Ok(true)
}

fn main() {
    let cli = Cli::parse();
    bmservice::logging::init_logging(&cli.log_level);

    let device_ids: Vec<u32> = (0..cli.devices).collect();
    let runtime: Arc<dyn bmservice::DeviceRuntime> = Arc::new(MockRuntime::new(device_ids.clone()));

    let mut runner = DeviceRunner::<Request, Response>::new(
        cli.model,
        device_ids,
        runtime,
        pre_process,
        post_process,
    )
    .expect("failed to start device runner");

    for id in 0..cli.requests {
        runner.push(Request {
            id,
            scale: 1.0 + id as f32,
        });
    }
    runner.join();

    let mut responses = Vec::new();
    while let Some((resp, status)) = runner.try_pop() {
        tracing::info!(id = resp.id, total = resp.total, valid = status.valid, "request completed");
        responses.push(resp);
    }

    println!("processed {} requests", responses.len());
    runner.show_status();

    let summary = serde_json::to_string(&responses.iter().map(|r| r.id).collect::<Vec<_>>())
        .expect("serialize summary");
    println!("completed ids: {summary}");
}

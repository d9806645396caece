//! Host-side, multi-stage, multi-device inference serving engine.
//!
//! A [`pipeline::Pipeline`] is a chain of [`stage::Stage`] worker threads
//! linked by [`queue::BoundedQueue`]s; a [`pool::PipelinePool`] runs several
//! pipelines in parallel, one per device, fanned in on a shared input queue
//! and fanned out on a shared output queue; [`device::DeviceRunner`]
//! specializes a pool to the pre/forward/post topology every model-serving
//! use of this engine builds. [`ffi`] exposes the whole thing as a small C
//! ABI for callers outside the Rust world.

#![allow(dead_code)]

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod stage;
pub mod status;
pub mod tensor;

pub use device::{DeviceContext, DeviceRunner, DeviceRuntime, MockRuntime};
pub use error::{BmError, ConfigError, DeviceError, UserError};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use pool::{PipelinePool, PipelinePoolBuilder};
pub use queue::BoundedQueue;
pub use stage::{Stage, StageOutcome};
pub use status::{ProcessStatInfo, ProcessStatus};
pub use tensor::{DType, Tensor, TensorVec};

//! The device layer: `DeviceRuntime` (the accelerator SDK seam),
//! `DeviceContext` (per-pipeline device state), and `DeviceRunner` (the
//! pre/forward/post `PipelinePool` specialization built on top of them).
//! Spec §4.5/§4.6.

pub mod context;
pub mod mock;
pub mod runner;
pub mod runtime;

pub use context::DeviceContext;
pub use mock::MockRuntime;
pub use runner::{DeviceRunner, ForwardOut, PostOut, PreOut};
pub use runtime::{DeviceAlloc, DeviceRuntime, NetworkInfo, TensorSpec};

//! The `DeviceRuntime` trait: the one seam between this engine and whatever
//! accelerator SDK actually owns device memory and runs inference (spec
//! §4.5). Grounded on the original's `bmlib_runtime`/`BMNetwork` pairing,
//! collapsed into a single trait object so the rest of the crate never
//! names a vendor SDK type.

use crate::error::DeviceError;
use crate::tensor::{DType, Tensor, TensorVec};

/// Static facts about a loaded network: its declared static batch size and
/// the shapes/dtypes of its input and output tensors.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub batch_size: u32,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<u32>,
    pub dtype: DType,
}

/// An opaque device-side allocation handle. The runtime hands these out from
/// `malloc_device_byte` and expects them back in `free_device_byte`; this
/// crate never reads or writes through one directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAlloc(pub u64);

/// The accelerator SDK surface this engine depends on. A production build
/// implements this over the vendor's device/runtime library; tests and the
/// demo binary use `MockRuntime` (spec §4.5, "Device Runtime is out of
/// scope — model as a trait").
pub trait DeviceRuntime: Send + Sync {
    /// Opens (or validates access to) the given device id.
    fn request_device(&self, device_id: u32) -> Result<(), DeviceError>;

    /// Loads a model/network from `path` onto `device_id`, returning its
    /// static shape/dtype info.
    fn load_model(&self, device_id: u32, path: &str) -> Result<NetworkInfo, DeviceError>;

    fn network_info(&self, device_id: u32) -> Result<NetworkInfo, DeviceError>;

    /// Allocates `bytes` of device memory on `device_id`.
    fn malloc_device_byte(&self, device_id: u32, bytes: usize) -> Result<DeviceAlloc, DeviceError>;

    fn free_device_byte(&self, device_id: u32, alloc: DeviceAlloc) -> Result<(), DeviceError>;

    /// Runs the loaded network on `device_id` against `inputs`, producing
    /// `outputs` tensors in network output order.
    fn launch_tensor_ex(
        &self,
        device_id: u32,
        network: &str,
        inputs: &TensorVec,
    ) -> Result<Vec<Tensor>, DeviceError>;

    /// Blocks until all queued work on `device_id` completes.
    fn thread_sync(&self, device_id: u32) -> Result<(), DeviceError>;
}

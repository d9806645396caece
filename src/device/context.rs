//! Per-pipeline device state (spec §4.5), grounded on `BMDeviceContext`:
//! one context per `PipelinePool` slot, holding the device handle, the
//! loaded network's shape info, and every allocation the pre/forward/post
//! stages made through it, freed in reverse order on drop.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::runtime::{DeviceAlloc, DeviceRuntime, NetworkInfo};
use crate::error::DeviceError;
use crate::tensor::TensorVec;

/// One device-side image buffer, backed by a tracked allocation (or, for
/// `alloc_images_without_mem`, metadata only — memory is attached later by
/// the caller). Mirrors the original's `bm_image` handles, which this crate
/// has no vendor image-processing library behind, so the buffer itself is
/// just the `DeviceAlloc` the image's memory lives in.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub dtype: u32,
    pub align_bytes: u32,
    pub alloc: Option<DeviceAlloc>,
}

/// A chain of tensor-vector transforms run on one side of the forward stage
/// (spec §4.5 `in_filters`/`out_filters`): resizing, normalization, NMS, or
/// any other transform a model needs between the pre/post user callbacks
/// and the raw network call.
pub type Filter = Box<dyn Fn(&mut TensorVec) -> anyhow::Result<()> + Send + Sync>;

/// Opaque per-stage scratch data a pre/post callback stashes on the context
/// and reads back on a later call. The original's `void* preExtra`/
/// `postExtra`/`configData` become a typed-erased `Box<dyn Any + Send>`
/// rather than an untyped pointer; callbacks downcast to their own type.
pub struct DeviceContext {
    pub device_id: u32,
    pub network: NetworkInfo,
    pub network_name: String,
    runtime: Arc<dyn DeviceRuntime>,
    allocations: Vec<DeviceAlloc>,
    named_mem: HashMap<String, DeviceAlloc>,
    pre_extra: Option<Box<dyn Any + Send>>,
    post_extra: Option<Box<dyn Any + Send>>,
    config_data: Option<Box<dyn Any + Send>>,
    in_filters: Vec<Filter>,
    out_filters: Vec<Filter>,
}

impl DeviceContext {
    /// Requests the device, loads `network_name`, and returns a fresh
    /// context. Mirrors `BMDeviceContext`'s constructor, which does both in
    /// one step and throws (here: returns `Err`) if either fails — the
    /// caller (a `PipelinePoolBuilder` context initializer) treats that as
    /// "this device slot stays absent".
    pub fn new(
        runtime: Arc<dyn DeviceRuntime>,
        device_id: u32,
        network_name: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        runtime.request_device(device_id)?;
        let network_name = network_name.into();
        let network = runtime.load_model(device_id, &network_name)?;
        Ok(Self {
            device_id,
            network,
            network_name,
            runtime,
            allocations: Vec::new(),
            named_mem: HashMap::new(),
            pre_extra: None,
            post_extra: None,
            config_data: None,
            in_filters: Vec::new(),
            out_filters: Vec::new(),
        })
    }

    pub fn batch_size(&self) -> u32 {
        self.network.batch_size
    }

    /// Allocates device memory and tracks it for release on drop.
    pub fn alloc_device_mem(&mut self, bytes: usize) -> Result<DeviceAlloc, DeviceError> {
        let alloc = self.runtime.malloc_device_byte(self.device_id, bytes)?;
        self.allocations.push(alloc);
        Ok(alloc)
    }

    /// Releases one tracked allocation early (e.g. a buffer returned to an
    /// upstream resource queue doesn't need this; only used when a context
    /// is deliberately shrinking its footprint mid-run).
    pub fn free_device_mem(&mut self, alloc: DeviceAlloc) -> Result<(), DeviceError> {
        let pos = self
            .allocations
            .iter()
            .position(|a| *a == alloc)
            .ok_or(DeviceError::UnknownAllocation)?;
        self.allocations.remove(pos);
        self.runtime.free_device_byte(self.device_id, alloc)
    }

    /// Allocates `num` image buffers of `height` x `width`, backed by a
    /// device allocation each (mirrors the original's `allocImages`, which
    /// is `allocImagesWithoutMem` plus a paired `allocDeviceMem` per image).
    /// Every image's allocation is tracked the same way `alloc_device_mem`'s
    /// is, so a plain `free_images` (or context teardown) releases it.
    pub fn alloc_images(
        &mut self,
        num: usize,
        height: u32,
        width: u32,
        format: u32,
        dtype: u32,
        align_bytes: u32,
        heap: u32,
    ) -> Result<Vec<Image>, DeviceError> {
        let _ = heap;
        let bytes = (height as usize) * (width as usize) * (align_bytes.max(1) as usize);
        (0..num)
            .map(|_| {
                let alloc = self.alloc_device_mem(bytes)?;
                Ok(Image {
                    width,
                    height,
                    format,
                    dtype,
                    align_bytes,
                    alloc: Some(alloc),
                })
            })
            .collect()
    }

    /// Creates image metadata with no backing allocation, to be attached to
    /// externally-managed memory later. Nothing is tracked for release since
    /// there is no allocation behind it yet.
    pub fn alloc_images_without_mem(
        &self,
        num: usize,
        height: u32,
        width: u32,
        format: u32,
        dtype: u32,
        align_bytes: u32,
    ) -> Vec<Image> {
        (0..num)
            .map(|_| Image {
                width,
                height,
                format,
                dtype,
                align_bytes,
                alloc: None,
            })
            .collect()
    }

    /// Releases a batch of images in reverse order, mirroring
    /// `free_device_mem`'s single-allocation release.
    pub fn free_images(&mut self, images: Vec<Image>) -> Result<(), DeviceError> {
        for image in images.into_iter().rev() {
            if let Some(alloc) = image.alloc {
                self.free_device_mem(alloc)?;
            }
        }
        Ok(())
    }

    /// Interns a named allocation: the first call for a given `name`
    /// allocates `bytes` and tracks it; later calls with the same `name`
    /// return the existing allocation without allocating again.
    pub fn get_or_alloc_named_mem(
        &mut self,
        name: impl Into<String>,
        bytes: usize,
    ) -> Result<DeviceAlloc, DeviceError> {
        let name = name.into();
        if let Some(alloc) = self.named_mem.get(&name) {
            return Ok(*alloc);
        }
        let alloc = self.alloc_device_mem(bytes)?;
        self.named_mem.insert(name, alloc);
        Ok(alloc)
    }

    /// Appends a filter to the chain run against input tensors before
    /// `launch_tensor_ex` (spec §4.6's "applies input filters").
    pub fn add_in_filter(&mut self, filter: Filter) {
        self.in_filters.push(filter);
    }

    /// Appends a filter to the chain run against output tensors after
    /// `launch_tensor_ex` (spec §4.6's "applies output filters").
    pub fn add_out_filter(&mut self, filter: Filter) {
        self.out_filters.push(filter);
    }

    pub fn in_filters(&self) -> &[Filter] {
        &self.in_filters
    }

    pub fn out_filters(&self) -> &[Filter] {
        &self.out_filters
    }

    /// Runs every registered input filter, in order, against `tensors`.
    pub fn apply_in_filters(&self, tensors: &mut TensorVec) -> anyhow::Result<()> {
        for filter in &self.in_filters {
            filter(tensors)?;
        }
        Ok(())
    }

    /// Runs every registered output filter, in order, against `tensors`.
    pub fn apply_out_filters(&self, tensors: &mut TensorVec) -> anyhow::Result<()> {
        for filter in &self.out_filters {
            filter(tensors)?;
        }
        Ok(())
    }

    pub fn set_pre_extra(&mut self, data: Box<dyn Any + Send>) {
        self.pre_extra = Some(data);
    }

    pub fn pre_extra(&self) -> Option<&(dyn Any + Send)> {
        self.pre_extra.as_deref()
    }

    pub fn set_post_extra(&mut self, data: Box<dyn Any + Send>) {
        self.post_extra = Some(data);
    }

    pub fn post_extra(&self) -> Option<&(dyn Any + Send)> {
        self.post_extra.as_deref()
    }

    pub fn set_config_data(&mut self, data: Box<dyn Any + Send>) {
        self.config_data = Some(data);
    }

    pub fn config_data(&self) -> Option<&(dyn Any + Send)> {
        self.config_data.as_deref()
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        for alloc in self.allocations.drain(..).rev() {
            if let Err(err) = self.runtime.free_device_byte(self.device_id, alloc) {
                tracing::warn!(device_id = self.device_id, error = %err, "failed to free device allocation on context teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockRuntime;
    use crate::tensor::{DType, Tensor};

    fn context() -> DeviceContext {
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(MockRuntime::new([0]));
        DeviceContext::new(runtime, 0, "test-model").unwrap()
    }

    #[test]
    fn alloc_images_tracks_allocations_and_free_images_releases_them() {
        let mut ctx = context();
        let images = ctx.alloc_images(2, 4, 4, 0, 0, 1, 0).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|img| img.alloc.is_some()));
        ctx.free_images(images).unwrap();
    }

    #[test]
    fn alloc_images_without_mem_has_no_allocation() {
        let ctx = context();
        let images = ctx.alloc_images_without_mem(3, 4, 4, 0, 0, 1);
        assert_eq!(images.len(), 3);
        assert!(images.iter().all(|img| img.alloc.is_none()));
    }

    #[test]
    fn get_or_alloc_named_mem_interns_by_name() {
        let mut ctx = context();
        let a = ctx.get_or_alloc_named_mem("weights", 1024).unwrap();
        let b = ctx.get_or_alloc_named_mem("weights", 1024).unwrap();
        assert_eq!(a, b);
        let c = ctx.get_or_alloc_named_mem("scratch", 256).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn filters_run_in_registration_order() {
        let mut ctx = context();
        ctx.add_in_filter(Box::new(|tensors: &mut TensorVec| {
            for t in tensors.iter_mut() {
                t.scale *= 2.0;
            }
            Ok(())
        }));
        ctx.add_in_filter(Box::new(|tensors: &mut TensorVec| {
            for t in tensors.iter_mut() {
                t.scale += 1.0;
            }
            Ok(())
        }));

        let mut tensors: TensorVec = vec![Tensor::new("x", vec![1], DType::F32)];
        tensors[0].scale = 1.0;
        ctx.apply_in_filters(&mut tensors).unwrap();
        assert_eq!(tensors[0].scale, 3.0);
    }

    #[test]
    fn filter_error_propagates() {
        let mut ctx = context();
        ctx.add_out_filter(Box::new(|_tensors: &mut TensorVec| {
            anyhow::bail!("bad output");
        }));
        let mut tensors: TensorVec = vec![Tensor::new("y", vec![1], DType::F32)];
        assert!(ctx.apply_out_filters(&mut tensors).is_err());
    }
}

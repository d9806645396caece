//! C ABI façade (spec §6), grounded on `interface.h`/`interface.cpp`: a
//! small set of `extern "C"` functions operating on opaque `u32` runner ids,
//! backed by a process-wide registry. Every entry point catches panics at
//! the boundary — an FFI caller must never observe an unwind.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;
use std::sync::{Mutex, OnceLock};

use crate::config;
use crate::device::{DeviceRuntime, MockRuntime};
use crate::tensor::{DType, Tensor};

pub const INVALID_TASK_ID: u32 = 0;

/// Wire-compatible tensor descriptor, byte-for-byte the original's
/// `tensor_data_t`.
#[repr(C)]
pub struct TensorData {
    pub dims: u32,
    pub shape: [u32; 8],
    pub dtype: u32,
    pub data: *mut u8,
}

struct InputItem {
    task_id: u32,
    tensors: Vec<Tensor>,
}

impl Default for InputItem {
    fn default() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            tensors: Vec::new(),
        }
    }
}

impl Clone for InputItem {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            tensors: self.tensors.clone(),
        }
    }
}

#[derive(Default)]
struct OutputItem {
    task_id: u32,
    tensors: Vec<Tensor>,
}

struct RunnerInfo {
    runner: crate::device::DeviceRunner<InputItem, OutputItem>,
    next_task_id: u32,
}

impl RunnerInfo {
    fn next_id(&mut self) -> u32 {
        self.next_task_id = self.next_task_id.wrapping_add(1);
        if self.next_task_id == INVALID_TASK_ID {
            self.next_task_id = self.next_task_id.wrapping_add(1);
        }
        self.next_task_id
    }
}

fn registry() -> &'static Mutex<HashMap<u32, RunnerInfo>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u32, RunnerInfo>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn pre_process(
    input: &InputItem,
    tensors: &mut Vec<Tensor>,
    _ctx: &crate::device::DeviceContext,
) -> anyhow::Result<bool> {
    if input.tensors.is_empty() {
        return Ok(false);
    }
    tensors.clear();
    tensors.extend(input.tensors.iter().cloned());
    Ok(true)
}

fn post_process(
    input: &InputItem,
    forward_tensors: &Vec<Tensor>,
    out: &mut OutputItem,
    _ctx: &crate::device::DeviceContext,
) -> anyhow::Result<bool> {
    out.task_id = input.task_id;
    out.tensors = forward_tensors.clone();
    Ok(true)
}

/// Starts a runner loading `model_name` across every currently-visible
/// device (spec §6: `runner_start`). Returns a fresh runner id, or `0` on
/// failure — `0` is never a valid runner id since task ids and runner ids
/// share the "0 means invalid" convention from the original.
///
/// # Safety
/// `model_name` must be a valid, NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_start(model_name: *const std::os::raw::c_char) -> u32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let model_name = unsafe { std::ffi::CStr::from_ptr(model_name) }
            .to_string_lossy()
            .into_owned();
        let device_ids = config::use_device_ids(visible_device_count());
        if device_ids.is_empty() {
            return INVALID_TASK_ID;
        }
        let runtime: std::sync::Arc<dyn DeviceRuntime> = std::sync::Arc::new(MockRuntime::new(device_ids.clone()));
        let runner = match crate::device::DeviceRunner::new(
            model_name,
            device_ids,
            runtime,
            pre_process,
            post_process,
        ) {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(error = %err, "runner_start failed");
                return INVALID_TASK_ID;
            }
        };

        let mut guard = registry().lock().unwrap();
        let mut runner_id = 1u32;
        while guard.contains_key(&runner_id) {
            runner_id += 1;
        }
        guard.insert(
            runner_id,
            RunnerInfo {
                runner,
                next_task_id: INVALID_TASK_ID,
            },
        );
        runner_id
    }));
    result.unwrap_or(INVALID_TASK_ID)
}

/// Starts a runner like `runner_start`, but overrides the network's
/// declared static batch size (spec §6: `runner_start_with_batch`).
///
/// # Safety
/// `model_name` must be a valid, NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_start_with_batch(
    model_name: *const std::os::raw::c_char,
    batch: u32,
) -> u32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let model_name = unsafe { std::ffi::CStr::from_ptr(model_name) }
            .to_string_lossy()
            .into_owned();
        let device_ids = config::use_device_ids(visible_device_count());
        if device_ids.is_empty() {
            return INVALID_TASK_ID;
        }
        let runtime: std::sync::Arc<dyn DeviceRuntime> =
            std::sync::Arc::new(MockRuntime::new(device_ids.clone()).with_batch_size(batch));
        let runner = match crate::device::DeviceRunner::new(
            model_name,
            device_ids,
            runtime,
            pre_process,
            post_process,
        ) {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(error = %err, "runner_start_with_batch failed");
                return INVALID_TASK_ID;
            }
        };

        let mut guard = registry().lock().unwrap();
        let mut runner_id = 1u32;
        while guard.contains_key(&runner_id) {
            runner_id += 1;
        }
        guard.insert(
            runner_id,
            RunnerInfo {
                runner,
                next_task_id: INVALID_TASK_ID,
            },
        );
        runner_id
    }));
    result.unwrap_or(INVALID_TASK_ID)
}

/// Stops and deregisters a runner (spec §6: `runner_stop`).
#[unsafe(no_mangle)]
pub extern "C" fn runner_stop(runner_id: u32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(mut info) = registry().lock().unwrap().remove(&runner_id) {
            info.runner.join();
        }
    }));
}

/// Blocks until `runner_id`'s input drains and every stage thread exits
/// gracefully, without deregistering the runner (spec §6: `runner_join`,
/// the graceful-drain counterpart to `runner_stop`'s immediate teardown).
#[unsafe(no_mangle)]
pub extern "C" fn runner_join(runner_id: u32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(info) = registry().lock().unwrap().get_mut(&runner_id) {
            info.runner.join();
        }
    }));
}

#[unsafe(no_mangle)]
pub extern "C" fn runner_empty(runner_id: u32) -> i32 {
    catch_unwind(AssertUnwindSafe(|| {
        registry()
            .lock()
            .unwrap()
            .get(&runner_id)
            .map(|info| info.runner.is_empty() as i32)
            .unwrap_or(1)
    }))
    .unwrap_or(1)
}

#[unsafe(no_mangle)]
pub extern "C" fn runner_all_stopped(runner_id: u32) -> i32 {
    catch_unwind(AssertUnwindSafe(|| {
        registry()
            .lock()
            .unwrap()
            .get(&runner_id)
            .map(|info| info.runner.all_stopped() as i32)
            .unwrap_or(1)
    }))
    .unwrap_or(1)
}

#[unsafe(no_mangle)]
pub extern "C" fn runner_show_status(runner_id: u32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(info) = registry().lock().unwrap().get(&runner_id) {
            info.runner.show_status();
        }
    }));
}

/// Copies `input_tensors` into an owned `InputItem` and pushes it (spec §6:
/// `runner_put_input`). `need_copy` mirrors the original flag; this binding
/// always copies, since Rust ownership makes "borrow the caller's buffer"
/// unsound across the FFI boundary once the background stage threads read
/// it asynchronously.
///
/// # Safety
/// `input_tensors` must point to `input_num` valid, readable `TensorData`
/// entries, each with `data` pointing to at least as many bytes as its
/// `shape`/`dtype` imply.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_put_input(
    runner_id: u32,
    input_num: u32,
    input_tensors: *const TensorData,
    _need_copy: i32,
) -> u32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut guard = registry().lock().unwrap();
        let Some(info) = guard.get_mut(&runner_id) else {
            return INVALID_TASK_ID;
        };
        let task_id = info.next_id();
        if input_num == 0 {
            info.runner.push(InputItem {
                task_id,
                tensors: Vec::new(),
            });
            return task_id;
        }

        let raw = unsafe { slice::from_raw_parts(input_tensors, input_num as usize) };
        let mut tensors = Vec::with_capacity(raw.len());
        for t in raw {
            let dtype = match DType::from_wire(t.dtype) {
                Ok(d) => d,
                Err(err) => {
                    tracing::error!(error = %err, "runner_put_input: unsupported dtype");
                    return INVALID_TASK_ID;
                }
            };
            let shape: Vec<u32> = t.shape[..t.dims as usize].to_vec();
            let mut tensor = Tensor::new(String::new(), shape, dtype);
            let byte_len = tensor.mem_size();
            tensor.data = unsafe { slice::from_raw_parts(t.data, byte_len) }.to_vec();
            tensors.push(tensor);
        }
        info.runner.push(InputItem { task_id, tensors });
        task_id
    }));
    result.unwrap_or(INVALID_TASK_ID)
}

unsafe fn write_output(
    task_id: u32,
    out_task_id: *mut u32,
    out_num: *mut u32,
    out_valid: *mut u32,
    item: OutputItem,
    valid: bool,
) -> *mut TensorData {
    unsafe {
        *out_task_id = task_id;
        *out_num = item.tensors.len() as u32;
        *out_valid = valid as u32;
    }
    let boxed: Box<[TensorData]> = item
        .tensors
        .into_iter()
        .map(|t| {
            let mut shape = [0u32; 8];
            for (slot, dim) in shape.iter_mut().zip(t.shape.iter()) {
                *slot = *dim;
            }
            let data_box = t.data.into_boxed_slice();
            let ptr = Box::into_raw(data_box) as *mut u8;
            TensorData {
                dims: t.shape.len() as u32,
                shape,
                dtype: t.dtype.to_wire(),
                data: ptr,
            }
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    Box::into_raw(boxed) as *mut TensorData
}

/// Blocks until a result is available (spec §6: `runner_get_output`).
///
/// # Safety
/// `task_id`, `output_num`, `is_valid` must be valid, writable pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_get_output(
    runner_id: u32,
    task_id: *mut u32,
    output_num: *mut u32,
    is_valid: *mut u32,
) -> *mut TensorData {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let guard = registry().lock().unwrap();
        let Some(info) = guard.get(&runner_id) else {
            return None;
        };
        info.runner.wait_and_pop()
    }));
    match result {
        Ok(Some((item, status))) => {
            let id = item.task_id;
            unsafe { write_output(id, task_id, output_num, is_valid, item, status.valid) }
        }
        _ => std::ptr::null_mut(),
    }
}

/// Non-blocking variant of `runner_get_output` (spec §6:
/// `runner_try_to_get_output`).
///
/// # Safety
/// Same preconditions as `runner_get_output`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_try_to_get_output(
    runner_id: u32,
    task_id: *mut u32,
    output_num: *mut u32,
    is_valid: *mut u32,
) -> *mut TensorData {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let guard = registry().lock().unwrap();
        let Some(info) = guard.get(&runner_id) else {
            return None;
        };
        info.runner.try_pop()
    }));
    match result {
        Ok(Some((item, status))) => {
            let id = item.task_id;
            unsafe { write_output(id, task_id, output_num, is_valid, item, status.valid) }
        }
        _ => std::ptr::null_mut(),
    }
}

/// Frees a result previously returned by `runner_get_output`/
/// `runner_try_to_get_output` (spec §6: `runner_release_output`).
///
/// # Safety
/// `output_data` must be a pointer previously returned by one of those two
/// functions, with `output_num` matching the value written through their
/// `output_num` out-parameter, and must not have been released already.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_release_output(output_num: u32, output_data: *mut TensorData) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if output_data.is_null() {
            return;
        }
        let slice = unsafe { Box::from_raw(slice::from_raw_parts_mut(output_data, output_num as usize)) };
        for t in slice.iter() {
            if !t.data.is_null() {
                let len = elem_count(&t.shape[..t.dims as usize]) * DType::from_wire(t.dtype).map(|d| d.size_bytes()).unwrap_or(1);
                unsafe { drop(Box::from_raw(slice::from_raw_parts_mut(t.data, len))) };
            }
        }
    }));
}

fn elem_count(shape: &[u32]) -> usize {
    shape.iter().map(|&d| d as usize).product()
}

/// Describes the shapes/dtypes `runner_put_input` expects: a `TensorData`
/// array with `data == null` (metadata only), one entry per network input
/// tensor (spec §6: `get_input_info`). Writes the entry count to `*num`.
///
/// # Safety
/// `num` must be a valid, writable pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn get_input_info(runner_id: u32, num: *mut u32) -> *mut TensorData {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let guard = registry().lock().unwrap();
        let info = guard.get(&runner_id)?;
        let ctx = info.runner.get_pipeline_context(0)?;
        Some(
            ctx.network
                .inputs
                .iter()
                .map(|spec| {
                    let mut shape = [0u32; 8];
                    for (slot, dim) in shape.iter_mut().zip(spec.shape.iter()) {
                        *slot = *dim;
                    }
                    TensorData {
                        dims: spec.shape.len() as u32,
                        shape,
                        dtype: spec.dtype.to_wire(),
                        data: std::ptr::null_mut(),
                    }
                })
                .collect::<Vec<_>>(),
        )
    }));
    match result {
        Ok(Some(entries)) => {
            unsafe { *num = entries.len() as u32 };
            Box::into_raw(entries.into_boxed_slice()) as *mut TensorData
        }
        _ => {
            unsafe { *num = 0 };
            std::ptr::null_mut()
        }
    }
}

/// Frees an array returned by `get_input_info` (spec §6:
/// `release_input_info`). Entries carry no backing data buffer (`data` is
/// always null), so this only reclaims the array itself.
///
/// # Safety
/// `info` must be a pointer previously returned by `get_input_info`, with
/// `num` matching the value written through its `num` out-parameter.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn release_input_info(num: u32, info: *mut TensorData) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if info.is_null() {
            return;
        }
        unsafe { drop(Box::from_raw(slice::from_raw_parts_mut(info, num as usize))) };
    }));
}

/// Writes up to `max_num` per-stage cumulative durations (microseconds)
/// into `durations`; returns how many were written (spec §6:
/// `get_runner_durations`).
///
/// # Safety
/// `durations` must point to at least `max_num` writable `u64` slots.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn get_runner_durations(
    runner_id: u32,
    durations: *mut u64,
    max_num: u32,
) -> u32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        registry()
            .lock()
            .unwrap()
            .get(&runner_id)
            .map(|info| info.runner.durations_micros())
            .unwrap_or_default()
    }));
    match result {
        Ok(values) => {
            let n = values.len().min(max_num as usize);
            let out = unsafe { slice::from_raw_parts_mut(durations, n) };
            out.copy_from_slice(&values[..n]);
            n as u32
        }
        Err(_) => 0,
    }
}

/// Restricts which device ids subsequent `runner_start` calls may use (spec
/// §6: `runner_use_devices`). Takes effect for runners started afterward.
///
/// # Safety
/// `device_ids` must point to at least `num` valid `u32`s.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn runner_use_devices(device_ids: *const u32, num: u32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let ids = unsafe { slice::from_raw_parts(device_ids, num as usize) }.to_vec();
        let mut guard = VISIBLE_DEVICES.lock().unwrap();
        *guard = Some(ids);
    }));
}

/// Writes up to `max_num` available device ids into `devices`; returns how
/// many were written (spec §6: `available_devices`).
///
/// # Safety
/// `devices` must point to at least `max_num` writable `u32` slots.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn available_devices(devices: *mut u32, max_num: u32) -> u32 {
    catch_unwind(AssertUnwindSafe(|| {
        let ids = config::use_device_ids(visible_device_count());
        let n = ids.len().min(max_num as usize);
        let out = unsafe { slice::from_raw_parts_mut(devices, n) };
        out.copy_from_slice(&ids[..n]);
        n as u32
    }))
    .unwrap_or(0)
}

static VISIBLE_DEVICES: Mutex<Option<Vec<u32>>> = Mutex::new(None);

/// Total device count the mock backend reports as visible, before
/// `BMSERVICE_USE_DEVICE` filtering. A real accelerator backend would query
/// the vendor SDK here instead.
fn visible_device_count() -> u32 {
    VISIBLE_DEVICES
        .lock()
        .unwrap()
        .as_ref()
        .map(|ids| ids.len() as u32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_lifecycle_roundtrips_a_task() {
        let model = std::ffi::CString::new("test-model").unwrap();
        let runner_id = unsafe { runner_start(model.as_ptr()) };
        assert_ne!(runner_id, INVALID_TASK_ID);

        let mut payload = [0u8; 4];
        let mut shape = [0u32; 8];
        shape[0] = 1;
        let tensor = TensorData {
            dims: 1,
            shape,
            dtype: DType::F32.to_wire(),
            data: payload.as_mut_ptr(),
        };
        let task_id = unsafe { runner_put_input(runner_id, 1, &tensor, 1) };
        assert_ne!(task_id, INVALID_TASK_ID);

        let mut out_task_id = 0u32;
        let mut out_num = 0u32;
        let mut is_valid = 0u32;
        let ptr =
            unsafe { runner_get_output(runner_id, &mut out_task_id, &mut out_num, &mut is_valid) };
        assert_eq!(out_task_id, task_id);
        assert_eq!(is_valid, 1);
        unsafe { runner_release_output(out_num, ptr) };

        runner_stop(runner_id);
        assert_eq!(runner_empty(runner_id), 1);
    }

    #[test]
    fn runner_start_with_batch_and_introspection_roundtrip() {
        let model = std::ffi::CString::new("test-model").unwrap();
        let runner_id = unsafe { runner_start_with_batch(model.as_ptr(), 4) };
        assert_ne!(runner_id, INVALID_TASK_ID);

        let mut num = 0u32;
        let info_ptr = unsafe { get_input_info(runner_id, &mut num) };
        assert!(num > 0);
        assert!(!info_ptr.is_null());
        unsafe { release_input_info(num, info_ptr) };

        let mut payload = [0u8; 4];
        let mut shape = [0u32; 8];
        shape[0] = 1;
        let tensor = TensorData {
            dims: 1,
            shape,
            dtype: DType::F32.to_wire(),
            data: payload.as_mut_ptr(),
        };
        let task_id = unsafe { runner_put_input(runner_id, 1, &tensor, 1) };
        assert_ne!(task_id, INVALID_TASK_ID);

        runner_join(runner_id);

        let mut durations = [0u64; 8];
        let n = unsafe { get_runner_durations(runner_id, durations.as_mut_ptr(), 8) };
        assert!(n > 0);

        runner_stop(runner_id);
        assert_eq!(runner_empty(runner_id), 1);
    }
}

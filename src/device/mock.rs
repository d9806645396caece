//! `MockRuntime`: a `DeviceRuntime` with no accelerator underneath it, for
//! unit tests and the demo binary. Every "device" is just an id; `forward`
//! echoes its inputs back as outputs so pipeline plumbing can be exercised
//! without real hardware (spec §4.5 Non-goals: "modeling the actual
//! inference kernel is out of scope").

use std::collections::HashSet;
use std::sync::Mutex;

use crate::device::runtime::{DeviceAlloc, DeviceRuntime, NetworkInfo, TensorSpec};
use crate::error::DeviceError;
use crate::tensor::{DType, Tensor, TensorVec};

pub struct MockRuntime {
    visible_devices: HashSet<u32>,
    batch_size: u32,
    next_alloc: Mutex<u64>,
    fail_launch: bool,
}

impl MockRuntime {
    pub fn new(visible_devices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            visible_devices: visible_devices.into_iter().collect(),
            batch_size: 1,
            next_alloc: Mutex::new(1),
            fail_launch: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Makes every `launch_tensor_ex` call fail, for exercising the
    /// device-fatal escalation path in `DeviceRunner`'s forward stage.
    pub fn with_failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }
}

impl DeviceRuntime for MockRuntime {
    fn request_device(&self, device_id: u32) -> Result<(), DeviceError> {
        if self.visible_devices.contains(&device_id) {
            Ok(())
        } else {
            Err(DeviceError::DeviceRequestFailed { device_id })
        }
    }

    fn load_model(&self, device_id: u32, path: &str) -> Result<NetworkInfo, DeviceError> {
        if path.is_empty() {
            return Err(DeviceError::ModelLoadFailed {
                path: path.to_string(),
            });
        }
        self.network_info(device_id)
    }

    fn network_info(&self, _device_id: u32) -> Result<NetworkInfo, DeviceError> {
        Ok(NetworkInfo {
            batch_size: self.batch_size,
            inputs: vec![TensorSpec {
                name: "input".to_string(),
                shape: vec![self.batch_size, 3, 224, 224],
                dtype: DType::F32,
            }],
            outputs: vec![TensorSpec {
                name: "output".to_string(),
                shape: vec![self.batch_size, 1000],
                dtype: DType::F32,
            }],
        })
    }

    fn malloc_device_byte(&self, _device_id: u32, _bytes: usize) -> Result<DeviceAlloc, DeviceError> {
        let mut next = self.next_alloc.lock().unwrap();
        let id = *next;
        *next += 1;
        Ok(DeviceAlloc(id))
    }

    fn free_device_byte(&self, _device_id: u32, _alloc: DeviceAlloc) -> Result<(), DeviceError> {
        Ok(())
    }

    fn launch_tensor_ex(
        &self,
        _device_id: u32,
        network: &str,
        inputs: &TensorVec,
    ) -> Result<Vec<Tensor>, DeviceError> {
        if self.fail_launch {
            return Err(DeviceError::LaunchFailed {
                network: network.to_string(),
            });
        }
        Ok(inputs.clone())
    }

    fn thread_sync(&self, _device_id: u32) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_is_rejected() {
        let runtime = MockRuntime::new([0, 1]);
        assert!(runtime.request_device(2).is_err());
        assert!(runtime.request_device(0).is_ok());
    }

    #[test]
    fn forward_echoes_input_tensors() {
        let runtime = MockRuntime::new([0]);
        let input = vec![Tensor::new("input", vec![1, 4], DType::F32)];
        let output = runtime.launch_tensor_ex(0, "net", &input).unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].name, "input");
    }

    #[test]
    fn failing_launch_reports_launch_failed() {
        let runtime = MockRuntime::new([0]).with_failing_launch();
        let input = vec![Tensor::new("input", vec![1, 4], DType::F32)];
        let err = runtime.launch_tensor_ex(0, "net", &input).unwrap_err();
        assert!(matches!(err, DeviceError::LaunchFailed { network } if network == "net"));
    }
}

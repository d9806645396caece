//! Tensor wire format and in-process tensor descriptors (spec §6).

use crate::error::DeviceError;

/// Element dtype, mirroring `bm_data_type_t` in the original C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl DType {
    /// Size in bytes of one element. Any value outside the eight supported
    /// kinds is fatal per spec §6.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F16 | DType::I16 | DType::U16 => 2,
            DType::I8 | DType::U8 => 1,
        }
    }

    /// Decodes the wire encoding used by `tensor_data_t::dtype`.
    pub fn from_wire(code: u32) -> Result<Self, DeviceError> {
        match code {
            0 => Ok(DType::F32),
            1 => Ok(DType::F16),
            2 => Ok(DType::I8),
            3 => Ok(DType::U8),
            4 => Ok(DType::I16),
            5 => Ok(DType::U16),
            6 => Ok(DType::I32),
            7 => Ok(DType::U32),
            other => Err(DeviceError::UnsupportedDtype(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::I8 => 2,
            DType::U8 => 3,
            DType::I16 => 4,
            DType::U16 => 5,
            DType::I32 => 6,
            DType::U32 => 7,
        }
    }
}

/// Maximum rank carried by the wire struct (`shape[8]` in the C ABI).
pub const MAX_DIMS: usize = 8;

/// One named tensor slot bound to a device-side buffer pool entry. The
/// engine never interprets `data`; it only tracks shape/dtype/scale for
/// wiring the Device Runtime's `launch_tensor_ex`.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<u32>,
    pub dtype: DType,
    pub scale: f32,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<u32>, dtype: DType) -> Self {
        let elems: usize = shape.iter().map(|&d| d as usize).product();
        Self {
            name: name.into(),
            shape,
            dtype,
            scale: 1.0,
            data: vec![0u8; elems * dtype.size_bytes()],
        }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    pub fn mem_size(&self) -> usize {
        self.elem_count() * self.dtype.size_bytes()
    }

    /// Overwrites the static batch dimension (shape[0]). Used when forward
    /// pads a smaller runtime batch up to the network's declared static
    /// batch size, and again to reset it afterward (spec §4.6).
    pub fn set_batch(&mut self, batch: u32) {
        if let Some(dim0) = self.shape.get_mut(0) {
            *dim0 = batch;
        }
    }
}

/// An ordered collection of tensors flowing between pre/forward/post.
pub type TensorVec = Vec<Tensor>;

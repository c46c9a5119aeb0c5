//! Quantized model execution
//!
//! `StreamingModel` drives inference through the `Interpreter` and
//! `InterpreterFactory` traits. `MicroInterpreter` is the bundled engine: it
//! parses the compiled model format in [`model`], plans tensors into the
//! caller's arena and runs the fixed streaming op set from [`kernels`].

pub mod kernels;
pub mod micro;
pub mod model;

pub use micro::{MicroInterpreter, MicroInterpreterFactory, VARIABLE_ARENA_SIZE};
pub use model::{Model, OpDef, Subgraph, TensorDef, MODEL_MAGIC, SUPPORTED_SCHEMA_VERSION};

use crate::arena::Arena;
use std::fmt;
use thiserror::Error;

/// Number of operations the streaming resolver can hold
pub const STREAMING_OP_CAPACITY: usize = 20;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model magic mismatch")]
    BadMagic,

    #[error("Model schema version {found} is not equal to supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Model is truncated: {0}")]
    Truncated(#[from] std::io::Error),

    #[error("Malformed model: {0}")]
    Malformed(String),

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("Operation {0} is not registered with the resolver")]
    UnsupportedOp(OpCode),

    #[error("Operation {0} is already registered")]
    DuplicateOp(OpCode),

    #[error("Op resolver is full ({0} operations)")]
    ResolverFull(usize),

    #[error("Invalid options for {op}: {reason}")]
    InvalidOptions { op: OpCode, reason: String },

    #[error("Arena too small: model needs {required} bytes, arena has {available}")]
    ArenaExhausted { required: usize, available: usize },

    #[error("Tensors have not been allocated")]
    NotAllocated,

    #[error("Input write of {len} bytes at offset {offset} exceeds tensor size {size}")]
    InputOutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Unsupported tensor type {0:?}")]
    UnsupportedType(DType),

    #[error("{op} failed: {reason}")]
    Kernel { op: OpCode, reason: String },
}

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DType {
    Float32 = 0,
    Int32 = 2,
    UInt8 = 3,
    Int8 = 9,
    Resource = 20,
}

impl DType {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(DType::Float32),
            2 => Some(DType::Int32),
            3 => Some(DType::UInt8),
            9 => Some(DType::Int8),
            20 => Some(DType::Resource),
            _ => None,
        }
    }

    /// Element size in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int32 | DType::Float32 | DType::Resource => 4,
        }
    }
}

/// Affine quantization: `real = (q - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// Built-in operations, numbered as in the model format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Add = 0,
    AveragePool2D = 1,
    Concatenation = 2,
    Conv2D = 3,
    DepthwiseConv2D = 4,
    FullyConnected = 9,
    Logistic = 14,
    MaxPool2D = 17,
    Mul = 18,
    Reshape = 22,
    Pad = 34,
    Mean = 40,
    StridedSlice = 45,
    Pack = 83,
    SplitV = 102,
    Quantize = 114,
    CallOnce = 129,
    VarHandle = 142,
    ReadVariable = 143,
    AssignVariable = 144,
}

impl OpCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use OpCode::*;
        let op = match code {
            0 => Add,
            1 => AveragePool2D,
            2 => Concatenation,
            3 => Conv2D,
            4 => DepthwiseConv2D,
            9 => FullyConnected,
            14 => Logistic,
            17 => MaxPool2D,
            18 => Mul,
            22 => Reshape,
            34 => Pad,
            40 => Mean,
            45 => StridedSlice,
            83 => Pack,
            102 => SplitV,
            114 => Quantize,
            129 => CallOnce,
            142 => VarHandle,
            143 => ReadVariable,
            144 => AssignVariable,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The operations streaming wake word and VAD models are built from
pub const STREAMING_OPS: [OpCode; STREAMING_OP_CAPACITY] = [
    OpCode::CallOnce,
    OpCode::VarHandle,
    OpCode::Reshape,
    OpCode::ReadVariable,
    OpCode::StridedSlice,
    OpCode::Concatenation,
    OpCode::AssignVariable,
    OpCode::Conv2D,
    OpCode::Mul,
    OpCode::Add,
    OpCode::Mean,
    OpCode::FullyConnected,
    OpCode::Logistic,
    OpCode::Quantize,
    OpCode::DepthwiseConv2D,
    OpCode::AveragePool2D,
    OpCode::MaxPool2D,
    OpCode::Pad,
    OpCode::Pack,
    OpCode::SplitV,
];

/// Fixed-capacity registry of the operations an interpreter may execute
#[derive(Debug, Clone)]
pub struct OpResolver {
    ops: Vec<OpCode>,
    capacity: usize,
}

impl OpResolver {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, op: OpCode) -> Result<(), InferenceError> {
        if self.ops.contains(&op) {
            return Err(InferenceError::DuplicateOp(op));
        }
        if self.ops.len() >= self.capacity {
            return Err(InferenceError::ResolverFull(self.capacity));
        }
        self.ops.push(op);
        Ok(())
    }

    /// Resolver holding exactly the streaming op set
    pub fn streaming() -> Result<Self, InferenceError> {
        let mut resolver = Self::with_capacity(STREAMING_OP_CAPACITY);
        resolver.register_streaming_ops()?;
        Ok(resolver)
    }

    /// Register every operation in [`STREAMING_OPS`]
    pub fn register_streaming_ops(&mut self) -> Result<(), InferenceError> {
        STREAMING_OPS.iter().try_for_each(|&op| self.add(op))
    }

    pub fn contains(&self, op: OpCode) -> bool {
        self.ops.contains(&op)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Scalar read from a model's output tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputValue {
    Float32(f32),
    Int8(i8),
    UInt8(u8),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputTensor {
    pub value: OutputValue,
    pub quantization: Option<QuantParams>,
}

/// A model instance bound to its tensor arena
#[cfg_attr(test, mockall::automock)]
pub trait Interpreter: Send {
    /// Plan every tensor into `arena`
    fn allocate_tensors(&mut self, arena: &mut Arena) -> Result<(), InferenceError>;

    /// Shape of the first input tensor
    fn input_dims(&self) -> Vec<usize>;

    /// Copy int8 features into the first input tensor at `offset`
    fn write_input(
        &mut self,
        arena: &mut Arena,
        offset: usize,
        data: &[i8],
    ) -> Result<(), InferenceError>;

    fn invoke(&mut self, arena: &mut Arena) -> Result<(), InferenceError>;

    /// First element of the first output tensor
    fn output(&self, arena: &Arena) -> Result<OutputTensor, InferenceError>;

    /// Bytes of the arena the plan actually uses
    fn arena_used_bytes(&self) -> usize;
}

/// Builds interpreters from raw model bytes
#[cfg_attr(test, mockall::automock)]
pub trait InterpreterFactory: Send + Sync {
    fn create(
        &self,
        model_data: &[u8],
        resolver: &OpResolver,
    ) -> Result<Box<dyn Interpreter>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_resolver_is_exactly_full() {
        let mut resolver = OpResolver::with_capacity(STREAMING_OP_CAPACITY);
        resolver.register_streaming_ops().unwrap();

        assert_eq!(resolver.len(), STREAMING_OP_CAPACITY);
        assert!(resolver.contains(OpCode::CallOnce));
        assert!(resolver.contains(OpCode::SplitV));
    }

    #[test]
    fn test_resolver_capacity_and_duplicates() {
        let mut resolver = OpResolver::with_capacity(2);
        resolver.add(OpCode::Add).unwrap();

        assert!(matches!(
            resolver.add(OpCode::Add),
            Err(InferenceError::DuplicateOp(OpCode::Add))
        ));

        resolver.add(OpCode::Mul).unwrap();
        assert!(matches!(
            resolver.add(OpCode::Pad),
            Err(InferenceError::ResolverFull(2))
        ));
        assert!(!resolver.contains(OpCode::Pad));
    }

    #[test]
    fn test_opcode_numbering_is_stable() {
        for op in STREAMING_OPS {
            assert_eq!(OpCode::from_u8(op as u8), Some(op));
        }
        assert_eq!(OpCode::from_u8(5), None);
        assert_eq!(DType::from_u8(DType::Int8 as u8), Some(DType::Int8));
        assert_eq!(DType::from_u8(1), None);
    }
}

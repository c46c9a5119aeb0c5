//! Compiled model format
//!
//! Little-endian binary layout:
//!
//! ```text
//! magic "MWWM" | schema version u32 | subgraph count u32 | subgraphs...
//! subgraph: tensor count u32 | tensors | inputs | outputs | operator count u32 | operators
//! tensor:   dtype u8 | rank u8 | dims u32* | has_quant u8 [scale f32, zero_point i32]
//!           | has_data u8 [len u32, bytes]
//! inputs/outputs: count u32 | tensor index u32*
//! operator: opcode u8 | input count u8 | i32* (-1 = omitted) | output count u8 | u32*
//!           | param count u8 | i32*
//! ```

use super::{DType, InferenceError, OpCode, QuantParams};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// File magic
pub const MODEL_MAGIC: [u8; 4] = *b"MWWM";

/// The only schema version this runtime understands
pub const SUPPORTED_SCHEMA_VERSION: u32 = 3;

/// Tensor declaration; constant tensors carry their data
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub quantization: Option<QuantParams>,
    pub data: Option<Vec<u8>>,
}

impl TensorDef {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            quantization: None,
            data: None,
        }
    }

    pub fn quantized(mut self, scale: f32, zero_point: i32) -> Self {
        self.quantization = Some(QuantParams { scale, zero_point });
        self
    }

    /// Constant int8 tensor
    pub fn int8_const(shape: &[usize], values: &[i8]) -> Self {
        let mut tensor = Self::new(DType::Int8, shape);
        tensor.data = Some(values.iter().map(|&v| v as u8).collect());
        tensor
    }

    /// Constant int32 tensor (biases, shapes, axes)
    pub fn int32_const(shape: &[usize], values: &[i32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for &value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        let mut tensor = Self::new(DType::Int32, shape);
        tensor.data = Some(data);
        tensor
    }

    /// Constant float tensor
    pub fn float_const(shape: &[usize], values: &[f32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for &value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        let mut tensor = Self::new(DType::Float32, shape);
        tensor.data = Some(data);
        tensor
    }

    /// Element count, `None` if the shape overflows `usize`
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.num_elements()?.checked_mul(self.dtype.size())
    }

    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }
}

/// One operator invocation inside a subgraph
#[derive(Debug, Clone, PartialEq)]
pub struct OpDef {
    pub opcode: OpCode,
    pub inputs: Vec<Option<usize>>,
    pub outputs: Vec<usize>,
    pub params: Vec<i32>,
}

impl OpDef {
    pub fn new(opcode: OpCode, inputs: &[usize], outputs: &[usize]) -> Self {
        Self {
            opcode,
            inputs: inputs.iter().copied().map(Some).collect(),
            outputs: outputs.to_vec(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: &[i32]) -> Self {
        self.params = params.to_vec();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    pub tensors: Vec<TensorDef>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub operators: Vec<OpDef>,
}

impl Subgraph {
    /// Append a tensor, returning its index
    pub fn add_tensor(&mut self, tensor: TensorDef) -> usize {
        self.tensors.push(tensor);
        self.tensors.len() - 1
    }

    pub fn add_op(&mut self, op: OpDef) {
        self.operators.push(op);
    }
}

/// A parsed model; subgraph 0 is the entry point
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub version: u32,
    pub subgraphs: Vec<Subgraph>,
}

impl Model {
    pub fn new(subgraphs: Vec<Subgraph>) -> Self {
        Self {
            version: SUPPORTED_SCHEMA_VERSION,
            subgraphs,
        }
    }

    /// Parse and structurally validate model bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InferenceError> {
        let mut reader = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != MODEL_MAGIC {
            return Err(InferenceError::BadMagic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != SUPPORTED_SCHEMA_VERSION {
            return Err(InferenceError::UnsupportedSchema {
                found: version,
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }

        let subgraph_count = reader.read_u32::<LittleEndian>()? as usize;
        let mut subgraphs = Vec::new();
        for _ in 0..subgraph_count {
            subgraphs.push(read_subgraph(&mut reader)?);
        }

        if reader.position() as usize != bytes.len() {
            return Err(InferenceError::Malformed(format!(
                "{} trailing bytes",
                bytes.len() - reader.position() as usize
            )));
        }

        let model = Self { version, subgraphs };
        model.validate()?;
        Ok(model)
    }

    /// Serialize to the binary format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MODEL_MAGIC);
        put_u32(&mut out, self.version);
        put_u32(&mut out, self.subgraphs.len() as u32);

        for subgraph in &self.subgraphs {
            put_u32(&mut out, subgraph.tensors.len() as u32);
            for tensor in &subgraph.tensors {
                out.push(tensor.dtype as u8);
                out.push(tensor.shape.len() as u8);
                for &dim in &tensor.shape {
                    put_u32(&mut out, dim as u32);
                }
                match tensor.quantization {
                    Some(q) => {
                        out.push(1);
                        put_f32(&mut out, q.scale);
                        put_i32(&mut out, q.zero_point);
                    }
                    None => out.push(0),
                }
                match &tensor.data {
                    Some(data) => {
                        out.push(1);
                        put_u32(&mut out, data.len() as u32);
                        out.extend_from_slice(data);
                    }
                    None => out.push(0),
                }
            }

            for list in [&subgraph.inputs, &subgraph.outputs] {
                put_u32(&mut out, list.len() as u32);
                for &index in list {
                    put_u32(&mut out, index as u32);
                }
            }

            put_u32(&mut out, subgraph.operators.len() as u32);
            for op in &subgraph.operators {
                out.push(op.opcode as u8);
                out.push(op.inputs.len() as u8);
                for input in &op.inputs {
                    put_i32(&mut out, input.map_or(-1, |i| i as i32));
                }
                out.push(op.outputs.len() as u8);
                for &output in &op.outputs {
                    put_u32(&mut out, output as u32);
                }
                out.push(op.params.len() as u8);
                for &param in &op.params {
                    put_i32(&mut out, param);
                }
            }
        }

        out
    }

    pub(crate) fn validate(&self) -> Result<(), InferenceError> {
        let main = self
            .subgraphs
            .first()
            .ok_or_else(|| InferenceError::Malformed("model has no subgraphs".to_string()))?;
        if main.inputs.is_empty() || main.outputs.is_empty() {
            return Err(InferenceError::Malformed(
                "entry subgraph needs at least one input and one output".to_string(),
            ));
        }

        for (sg, subgraph) in self.subgraphs.iter().enumerate() {
            let count = subgraph.tensors.len();
            let in_range = |index: usize| index < count;

            let op_indices = subgraph.operators.iter().flat_map(|op| {
                op.inputs
                    .iter()
                    .flatten()
                    .chain(op.outputs.iter())
                    .copied()
            });
            if let Some(bad) = subgraph
                .inputs
                .iter()
                .chain(subgraph.outputs.iter())
                .copied()
                .chain(op_indices)
                .find(|&index| !in_range(index))
            {
                return Err(InferenceError::Malformed(format!(
                    "subgraph {sg} references tensor {bad} of {count}"
                )));
            }

            for (index, tensor) in subgraph.tensors.iter().enumerate() {
                let Some(byte_len) = tensor.byte_len() else {
                    return Err(InferenceError::Malformed(format!(
                        "tensor {index} in subgraph {sg} has unaddressable shape {:?}",
                        tensor.shape
                    )));
                };
                if let Some(data) = &tensor.data {
                    if data.len() != byte_len {
                        return Err(InferenceError::Malformed(format!(
                            "tensor {index} in subgraph {sg} holds {} bytes, shape needs {byte_len}",
                            data.len()
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn read_subgraph(reader: &mut Cursor<&[u8]>) -> Result<Subgraph, InferenceError> {
    let tensor_count = reader.read_u32::<LittleEndian>()? as usize;
    let mut tensors = Vec::new();
    for _ in 0..tensor_count {
        let dtype_code = reader.read_u8()?;
        let dtype = DType::from_u8(dtype_code).ok_or_else(|| {
            InferenceError::Malformed(format!("unknown tensor type {dtype_code}"))
        })?;

        let rank = reader.read_u8()? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            shape.push(reader.read_u32::<LittleEndian>()? as usize);
        }

        let quantization = if reader.read_u8()? != 0 {
            Some(QuantParams {
                scale: reader.read_f32::<LittleEndian>()?,
                zero_point: reader.read_i32::<LittleEndian>()?,
            })
        } else {
            None
        };

        let data = if reader.read_u8()? != 0 {
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let remaining = reader.get_ref().len() - reader.position() as usize;
            if len > remaining {
                return Err(InferenceError::Malformed(format!(
                    "tensor data of {len} bytes exceeds the {remaining} remaining"
                )));
            }
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data)?;
            Some(data)
        } else {
            None
        };

        tensors.push(TensorDef {
            dtype,
            shape,
            quantization,
            data,
        });
    }

    let inputs = read_index_list(reader)?;
    let outputs = read_index_list(reader)?;

    let op_count = reader.read_u32::<LittleEndian>()? as usize;
    let mut operators = Vec::new();
    for _ in 0..op_count {
        let code = reader.read_u8()?;
        let opcode = OpCode::from_u8(code).ok_or(InferenceError::UnknownOpcode(code))?;

        let input_count = reader.read_u8()? as usize;
        let mut op_inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let index = reader.read_i32::<LittleEndian>()?;
            op_inputs.push(usize::try_from(index).ok());
        }

        let output_count = reader.read_u8()? as usize;
        let mut op_outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            op_outputs.push(reader.read_u32::<LittleEndian>()? as usize);
        }

        let param_count = reader.read_u8()? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(reader.read_i32::<LittleEndian>()?);
        }

        operators.push(OpDef {
            opcode,
            inputs: op_inputs,
            outputs: op_outputs,
            params,
        });
    }

    Ok(Subgraph {
        tensors,
        inputs,
        outputs,
        operators,
    })
}

fn read_index_list(reader: &mut Cursor<&[u8]>) -> Result<Vec<usize>, InferenceError> {
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut list = Vec::new();
    for _ in 0..count {
        list.push(reader.read_u32::<LittleEndian>()? as usize);
    }
    Ok(list)
}

// Writes into a Vec cannot fail.
fn put_u32(out: &mut Vec<u8>, value: u32) {
    let _ = out.write_u32::<LittleEndian>(value);
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    let _ = out.write_i32::<LittleEndian>(value);
}

fn put_f32(out: &mut Vec<u8>, value: f32) {
    let _ = out.write_f32::<LittleEndian>(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> Model {
        let mut graph = Subgraph::default();
        let input = graph.add_tensor(TensorDef::new(DType::Int8, &[1, 3, 2]).quantized(1.0, 0));
        let output = graph.add_tensor(TensorDef::new(DType::Int8, &[1, 6]).quantized(1.0, 0));
        graph.inputs = vec![input];
        graph.outputs = vec![output];
        graph.add_op(OpDef::new(OpCode::Reshape, &[input], &[output]));
        Model::new(vec![graph])
    }

    #[test]
    fn test_bytes_parse_back() {
        let model = tiny_model();
        let bytes = model.to_bytes();
        assert_eq!(&bytes[..4], b"MWWM");
        assert_eq!(Model::from_bytes(&bytes).unwrap(), model);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = tiny_model().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Model::from_bytes(&bytes),
            Err(InferenceError::BadMagic)
        ));
    }

    #[test]
    fn test_rejects_other_schema_versions() {
        let mut model = tiny_model();
        model.version = 4;
        let result = Model::from_bytes(&model.to_bytes());
        assert!(matches!(
            result,
            Err(InferenceError::UnsupportedSchema { found: 4, supported: 3 })
        ));
    }

    #[test]
    fn test_rejects_truncated_model() {
        let bytes = tiny_model().to_bytes();
        let result = Model::from_bytes(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(InferenceError::Truncated(_))));
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let mut bytes = tiny_model().to_bytes();
        // The single operator's opcode is the first byte after the output list.
        let reshape = OpCode::Reshape as u8;
        let position = bytes.iter().rposition(|&b| b == reshape).unwrap();
        bytes[position] = 250;
        assert!(matches!(
            Model::from_bytes(&bytes),
            Err(InferenceError::UnknownOpcode(250))
        ));
    }

    #[test]
    fn test_rejects_dangling_tensor_reference() {
        let mut model = tiny_model();
        model.subgraphs[0].operators[0].outputs = vec![9];
        assert!(matches!(
            Model::from_bytes(&model.to_bytes()),
            Err(InferenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_constant_size_mismatch() {
        let mut model = tiny_model();
        model.subgraphs[0].add_tensor(TensorDef {
            data: Some(vec![0; 3]),
            ..TensorDef::new(DType::Int32, &[2])
        });
        assert!(matches!(
            Model::from_bytes(&model.to_bytes()),
            Err(InferenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_shape_too_large_to_address() {
        let huge = TensorDef::new(DType::Int8, &[1 << 20; 4]);
        assert_eq!(huge.num_elements(), None);
        assert_eq!(huge.byte_len(), None);

        let mut model = tiny_model();
        model.subgraphs[0].tensors[1] = huge;
        assert!(matches!(
            Model::from_bytes(&model.to_bytes()),
            Err(InferenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_tensor_sizes() {
        let tensor = TensorDef::new(DType::Float32, &[1, 3, 40]);
        assert_eq!(tensor.num_elements(), Some(120));
        assert_eq!(tensor.byte_len(), Some(480));
    }
}
